//! Remote prediction records as reported by the prediction service.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PredictionStatus {
    /// Only `succeeded` and `failed` end tracking. A `canceled` job is
    /// mirrored but stays eligible for polling.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for PredictionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job as echoed by the creation or polling endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteJob {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub input: serde_json::Value,
    /// Result reference(s). Replicate-style services call this `output`.
    #[serde(default, alias = "output", skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

impl RemoteJob {
    /// The error payload, if the service reported one.
    ///
    /// `null` and empty strings count as "no error".
    pub fn error_message(&self) -> Option<String> {
        error_message(self.error.as_ref())
    }
}

pub(crate) fn error_message(error: Option<&serde_json::Value>) -> Option<String> {
    match error? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_is_terminal() {
        assert!(!PredictionStatus::Starting.is_terminal());
        assert!(!PredictionStatus::Processing.is_terminal());
        assert!(PredictionStatus::Succeeded.is_terminal());
        assert!(PredictionStatus::Failed.is_terminal());
        assert!(!PredictionStatus::Canceled.is_terminal());
    }

    #[test]
    fn status_round_trips_lowercase() {
        let status: PredictionStatus = serde_json::from_value(json!("processing")).unwrap();
        assert_eq!(status, PredictionStatus::Processing);
        assert_eq!(serde_json::to_value(status).unwrap(), json!("processing"));
        assert_eq!(PredictionStatus::Canceled.to_string(), "canceled");
    }

    #[test]
    fn remote_job_accepts_output_alias() {
        let job: RemoteJob = serde_json::from_value(json!({
            "id": "abc",
            "status": "succeeded",
            "input": {"prompt": "a fox"},
            "output": ["https://example.com/a.png"]
        }))
        .unwrap();

        assert_eq!(job.result, Some(json!(["https://example.com/a.png"])));
        assert_eq!(job.error_message(), None);
    }

    #[test]
    fn remote_job_serializes_without_empty_fields() {
        let job = RemoteJob {
            id: "abc".to_string(),
            status: PredictionStatus::Starting,
            input: json!({"prompt": "a fox"}),
            result: None,
            error: None,
        };
        insta::assert_json_snapshot!(job, @r#"
        {
          "id": "abc",
          "status": "starting",
          "input": {
            "prompt": "a fox"
          }
        }
        "#);
    }

    #[test]
    fn remote_job_missing_input_defaults_to_null() {
        let job: RemoteJob =
            serde_json::from_value(json!({"id": "abc", "status": "starting"})).unwrap();
        assert!(job.input.is_null());
        assert!(job.result.is_none());
    }

    #[test]
    fn error_message_ignores_null_and_empty() {
        assert_eq!(error_message(Some(&json!(null))), None);
        assert_eq!(error_message(Some(&json!(""))), None);
        assert_eq!(error_message(Some(&json!("boom"))), Some("boom".to_string()));
        assert_eq!(
            error_message(Some(&json!({"detail": "nope"}))),
            Some(r#"{"detail":"nope"}"#.to_string())
        );
    }
}
