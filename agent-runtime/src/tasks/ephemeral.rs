//! The inline executor: `step` runs its closure directly, `sleep` is a
//! local timer, `waitForEvent` is refused outright (§4.5 — ephemeral tasks
//! have no durable-wait capability to delegate to).

use std::time::Duration;

use async_trait::async_trait;

use crate::error::TaskError;
use crate::tasks::{StepExecutor, StepFn};

pub struct EphemeralExecutor;

#[async_trait]
impl StepExecutor for EphemeralExecutor {
    async fn step(
        &self,
        _task_id: &str,
        _name: &str,
        _input: serde_json::Value,
        compute: StepFn,
    ) -> Result<serde_json::Value, TaskError> {
        compute().await
    }

    async fn sleep(&self, _task_id: &str, _name: &str, duration: Duration) -> Result<(), TaskError> {
        tokio::time::sleep(duration).await;
        Ok(())
    }

    async fn wait_for_event(
        &self,
        _task_id: &str,
        _name: &str,
        _event_type: &str,
        _timeout: Option<Duration>,
    ) -> Result<serde_json::Value, TaskError> {
        Err(TaskError::EphemeralCannotWait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn step_runs_the_closure_inline() {
        let executor = EphemeralExecutor;
        let result = executor
            .step(
                "t1",
                "compute",
                serde_json::json!(null),
                Box::new(|| Box::pin(async { Ok(serde_json::json!(42)) })),
            )
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!(42));
    }

    #[tokio::test]
    async fn wait_for_event_is_refused() {
        let executor = EphemeralExecutor;
        let err = executor.wait_for_event("t1", "approval", "approved", None).await;
        assert!(matches!(err, Err(TaskError::EphemeralCannotWait)));
    }
}
