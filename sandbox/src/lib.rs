//! Sandboxed execution of untrusted programs: one fresh temp directory and
//! one new process group per run, wall-clock enforcement from the outside,
//! CPU/memory limits injected by the language adapters from the inside.

mod cpp;
mod process;
mod python;
mod script;
pub mod truncate;

pub use cpp::CppAdapter;
pub use process::COMPILE_ERROR_EXIT_CODE;
pub use process::ProcessExecuteResult;
pub use process::ProcessExecutor;
pub use process::SandboxErr;
pub use process::TIMEOUT_EXIT_CODE;
pub use python::DURATION_MARK;
pub use python::PythonAdapter;
pub use python::SCRIPT_ENDING_MARK;
pub use script::LanguageAdapter;
pub use script::ScriptExecutor;
pub use script::Stage;
pub use script::StageKind;
pub use script::render_command;

pub type Result<T> = std::result::Result<T, SandboxErr>;
