use serde::Deserialize;
use serde::Serialize;

/// Languages the judge accepts. The `type` field of a submission selects one;
/// unknown tags are rejected by serde at the HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Cpp,
}

impl Language {
    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Cpp => "cpp",
        }
    }
}

/// One program to judge.
///
/// `input` and `expected_output` are optional and their absence is
/// distinguished from an empty string: an empty `expected_output` still runs
/// the comparison (and matches empty trimmed stdout), while a missing one
/// skips it entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    #[serde(rename = "type")]
    pub language: Language,
    pub solution: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_id: Option<String>,
}

/// Deadline regime for a work item. Short mode lets workers drop stale items
/// with `queue_timeout`; long mode has no staleness cut-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Short,
    Long,
}

/// The message on the work queue: a submission plus routing metadata.
///
/// `enqueued_at` is broker-clock seconds, not a local timestamp, so staleness
/// decisions are immune to clock drift between dispatcher and worker hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub work_id: String,
    pub submission: Submission,
    pub enqueued_at: f64,
    pub mode: Mode,
}

impl WorkItem {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// The literal `"batch"` tag on batch request bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchTag {
    Batch,
}

/// An ordered list of submissions judged together. The response preserves
/// input order regardless of which worker finishes first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    #[serde(rename = "type")]
    pub tag: BatchTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_id: Option<String>,
    pub submissions: Vec<Submission>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub sub_id: Option<String>,
    pub results: Vec<crate::JudgeResult>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn submission_accepts_the_wire_shape() {
        let json = r#"{"type":"python","solution":"print(input())","input":"a","expected_output":"a"}"#;
        let sub: Submission = serde_json::from_str(json).expect("decode");
        assert_eq!(sub.language, Language::Python);
        assert_eq!(sub.input.as_deref(), Some("a"));
        assert_eq!(sub.sub_id, None);
    }

    #[test]
    fn missing_fields_stay_distinct_from_empty_strings() {
        let absent: Submission =
            serde_json::from_str(r#"{"type":"cpp","solution":"int main(){}"}"#).expect("decode");
        let empty: Submission = serde_json::from_str(
            r#"{"type":"cpp","solution":"int main(){}","expected_output":""}"#,
        )
        .expect("decode");
        assert_eq!(absent.expected_output, None);
        assert_eq!(empty.expected_output, Some(String::new()));
    }

    #[test]
    fn unknown_language_tag_is_rejected() {
        let err = serde_json::from_str::<Submission>(r#"{"type":"rust","solution":""}"#);
        assert!(err.is_err());
    }

    #[test]
    fn work_item_round_trips_through_the_queue_encoding() {
        let item = WorkItem {
            work_id: "w-1".to_string(),
            submission: Submission {
                language: Language::Cpp,
                solution: "int main(){return 0;}".to_string(),
                input: None,
                expected_output: Some("a".to_string()),
                sub_id: Some("client-7".to_string()),
            },
            enqueued_at: 1712.25,
            mode: Mode::Short,
        };
        let bytes = item.encode().expect("encode");
        assert_eq!(WorkItem::decode(&bytes).expect("decode"), item);
    }

    #[test]
    fn mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Mode::Short).expect("json"), r#""short""#);
        assert_eq!(serde_json::to_string(&Mode::Long).expect("json"), r#""long""#);
    }

    #[test]
    fn batch_request_requires_the_batch_tag() {
        let ok = r#"{"type":"batch","submissions":[]}"#;
        assert!(serde_json::from_str::<BatchRequest>(ok).is_ok());
        let bad = r#"{"type":"bulk","submissions":[]}"#;
        assert!(serde_json::from_str::<BatchRequest>(bad).is_err());
    }
}
