//! Wire types shared by the dispatcher, the workers, and the broker keys they
//! meet on. Everything here is plain serde data; no component logic.

pub mod keys;
mod submission;
mod verdict;

pub use submission::BatchRequest;
pub use submission::BatchResponse;
pub use submission::BatchTag;
pub use submission::Language;
pub use submission::Mode;
pub use submission::Submission;
pub use submission::WorkItem;
pub use verdict::JudgeResult;
pub use verdict::Reason;
pub use verdict::outputs_match;
