//! Step and test case results.
//!
//! Results carry no reference to the closures that produced them, so they can
//! be serialized and handed to reporters as-is.

use super::StepMode;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFailure {
    pub message: String,
    /// Error chain, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<String>,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: Vec::new(),
        }
    }
}

impl From<&anyhow::Error> for StepFailure {
    fn from(error: &anyhow::Error) -> Self {
        Self {
            message: error.to_string(),
            stack: error.chain().map(|cause| cause.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub index: usize,
    #[serde(rename = "type")]
    pub mode: StepMode,
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
}

impl StepResult {
    pub fn passed(&self) -> bool {
        self.status == StepStatus::Passed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseResult {
    pub id: String,
    pub name: String,
    pub passed: bool,
    pub duration_ms: u64,
    pub steps: Vec<StepResult>,
    /// First failure, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    pub passed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
}

impl TestCaseResult {
    pub(crate) fn new(
        id: &str,
        name: &str,
        duration_ms: u64,
        steps: Vec<StepResult>,
        error: Option<StepFailure>,
    ) -> Self {
        let count = |status: StepStatus| steps.iter().filter(|s| s.status == status).count();
        let passed_steps = count(StepStatus::Passed);
        let failed_steps = count(StepStatus::Failed);
        let skipped_steps = count(StepStatus::Skipped);
        Self {
            id: id.to_string(),
            name: name.to_string(),
            passed: error.is_none() && failed_steps == 0,
            duration_ms,
            steps,
            error,
            passed_steps,
            failed_steps,
            skipped_steps,
        }
    }

    /// First failed step.
    pub fn first_failure(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(index: usize, status: StepStatus) -> StepResult {
        StepResult {
            index,
            mode: StepMode::Action,
            component: "client".to_string(),
            message_type: None,
            description: Some("send".to_string()),
            status,
            duration_ms: 1,
            error: (status == StepStatus::Failed).then(|| StepFailure::new("boom")),
        }
    }

    #[test]
    fn test_counts_and_first_failure() {
        let result = TestCaseResult::new(
            "t1",
            "case",
            3,
            vec![
                step(0, StepStatus::Passed),
                step(1, StepStatus::Failed),
                step(2, StepStatus::Skipped),
            ],
            Some(StepFailure::new("boom")),
        );
        assert!(!result.passed);
        assert_eq!(
            (result.passed_steps, result.failed_steps, result.skipped_steps),
            (1, 1, 1)
        );
        assert_eq!(result.first_failure().unwrap().index, 1);
    }

    #[test]
    fn test_serialized_shape_is_camel_case() {
        let value = serde_json::to_value(step(0, StepStatus::Failed)).unwrap();
        assert_eq!(value["type"], json!("action"));
        assert_eq!(value["status"], json!("failed"));
        assert_eq!(value["durationMs"], json!(1));
        assert_eq!(value["error"]["message"], json!("boom"));
        assert!(value.get("messageType").is_none());
    }

    #[test]
    fn test_failure_keeps_error_chain() {
        let error = anyhow::anyhow!("connection reset").context("send failed");
        let failure = StepFailure::from(&error);
        assert_eq!(failure.message, "send failed");
        assert_eq!(failure.stack, vec!["send failed", "connection reset"]);
    }
}
