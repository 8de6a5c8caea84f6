//! Demo handlers registered by `spool work`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use spool_core::app::{TaskHandler, WorkerBuilder, handler_fn};
use spool_core::domain::{Task, TaskResult};
use spool_core::error::{HandlerError, RegistryError};

/// `echo`: hands the parameters back as result data.
fn echo() -> Arc<dyn TaskHandler> {
    handler_fn(|task: Task| async move {
        Ok::<_, HandlerError>(TaskResult::success(1).with_data(task.parameters))
    })
}

#[derive(Debug, Deserialize)]
struct SleepParams {
    #[serde(default = "default_sleep_ms")]
    ms: u64,
}

fn default_sleep_ms() -> u64 {
    1000
}

/// `sleep`: waits `ms` milliseconds (default 1000). Handy for watching
/// heartbeats and for cancel-while-claimed experiments.
struct SleepHandler;

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn process(&self, task: &Task) -> Result<TaskResult, HandlerError> {
        let params: SleepParams = task.decode_parameters()?;
        tokio::time::sleep(Duration::from_millis(params.ms)).await;
        Ok(TaskResult::success(0).with_data(json!({ "slept_ms": params.ms })))
    }
}

#[derive(Debug, Deserialize)]
struct FailParams {
    #[serde(default)]
    message: Option<String>,
}

/// `fail`: always fails, to exercise the retry path.
struct FailHandler;

#[async_trait]
impl TaskHandler for FailHandler {
    async fn process(&self, task: &Task) -> Result<TaskResult, HandlerError> {
        let params: FailParams = task.decode_parameters()?;
        Err(HandlerError::msg(
            params
                .message
                .unwrap_or_else(|| format!("{} failed on purpose", task.id)),
        ))
    }
}

pub fn register(builder: WorkerBuilder) -> Result<WorkerBuilder, RegistryError> {
    builder
        .handler("echo", echo())?
        .handler("sleep", Arc::new(SleepHandler))?
        .handler("fail", Arc::new(FailHandler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use spool_core::domain::{TaskId, TaskType};
    use spool_core::queue::TaskStatus;

    fn task(task_type: &str, parameters: serde_json::Value) -> Task {
        Task {
            id: TaskId::new(1),
            task_type: TaskType::new(task_type),
            parameters,
            priority: 0,
            status: TaskStatus::Running,
            retry_count: 0,
            max_retries: 3,
            run_after: None,
            created_at: Utc::now(),
            claimed_at: Some(Utc::now()),
            completed_at: None,
            claimed_by: None,
            error_message: None,
            result_data: None,
        }
    }

    #[tokio::test]
    async fn echo_returns_parameters() {
        let result = echo()
            .process(&task("echo", json!({"msg": "hi"})))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.data, Some(json!({"msg": "hi"})));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_waits_requested_time() {
        let start = tokio::time::Instant::now();
        let result = SleepHandler
            .process(&task("sleep", json!({"ms": 250})))
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(250));
        assert_eq!(result.data, Some(json!({"slept_ms": 250})));
    }

    #[tokio::test]
    async fn fail_uses_custom_message() {
        let err = FailHandler
            .process(&task("fail", json!({"message": "boom"})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");

        let err = FailHandler.process(&task("fail", json!({}))).await.unwrap_err();
        assert_eq!(err.to_string(), "task-1 failed on purpose");
    }

    #[tokio::test]
    async fn bad_parameters_are_handler_errors() {
        let err = SleepHandler
            .process(&task("sleep", json!({"ms": "soon"})))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParameters(_)));
    }
}
