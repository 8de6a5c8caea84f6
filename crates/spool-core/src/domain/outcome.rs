//! Task result model: what a handler hands back to the worker.
//!
//! The store only interprets `success`; `data` and `error` become the task's
//! `result_data` / `error_message`.

use serde::{Deserialize, Serialize};

use crate::error::HandlerError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,

    /// Domain-specific count (videos scraped, titles generated, ...).
    #[serde(default)]
    pub items_processed: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn success(items_processed: u64) -> Self {
        Self {
            success: true,
            items_processed,
            data: None,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            items_processed: 0,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Error text stored on failure. Handlers that fail without a message
    /// still leave something readable behind.
    pub fn error_message(&self) -> Option<String> {
        if self.success {
            return None;
        }
        Some(
            self.error
                .clone()
                .unwrap_or_else(|| "task failed without an error message".to_string()),
        )
    }
}

impl From<HandlerError> for TaskResult {
    fn from(err: HandlerError) -> Self {
        TaskResult::failure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failure_without_message_gets_placeholder() {
        let result = TaskResult {
            success: false,
            items_processed: 0,
            data: None,
            error: None,
        };
        assert!(result.error_message().unwrap().contains("without an error message"));
        assert_eq!(TaskResult::success(3).error_message(), None);
    }

    #[test]
    fn handler_error_becomes_failed_result() {
        let result: TaskResult = HandlerError::msg("quota exceeded").into();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("quota exceeded"));
    }

    #[test]
    fn optional_fields_are_skipped() {
        let v = serde_json::to_value(TaskResult::success(2).with_data(json!({"ids": [1, 2]}))).unwrap();
        assert_eq!(v["items_processed"], 2);
        assert!(v.get("error").is_none());
    }
}
