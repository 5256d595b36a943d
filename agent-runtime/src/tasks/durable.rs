//! The durable-step capability interface (§1, §4.5 — "specified, not
//! implemented"): the core ships this trait, an adapter onto
//! [`StepExecutor`], and an in-memory test double. A production backend
//! (temporal-, workflow-engine-, or queue-backed) is a host concern.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::TaskError;
use crate::tasks::{StepExecutor, StepFn};

#[async_trait]
pub trait DurableStepExecutor: Send + Sync {
    async fn step(
        &self,
        workflow_instance_id: &str,
        name: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, TaskError>;

    async fn sleep(&self, workflow_instance_id: &str, name: &str, duration: Duration) -> Result<(), TaskError>;

    async fn wait_for_event(
        &self,
        workflow_instance_id: &str,
        name: &str,
        event_type: &str,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, TaskError>;

    async fn terminate(&self, workflow_instance_id: &str) -> Result<(), TaskError>;
}

/// Adapts a [`DurableStepExecutor`] to the [`StepExecutor`] surface a task
/// body calls through. The closure a caller passes to `step` is ignored —
/// a durable step is replayed by the external backend by `name`, not by
/// re-running a Rust closure that can't be checkpointed or shipped across
/// a process boundary.
pub struct DurableExecutorAdapter {
    pub workflow_instance_id: String,
    pub inner: Arc<dyn DurableStepExecutor>,
}

#[async_trait]
impl StepExecutor for DurableExecutorAdapter {
    async fn step(
        &self,
        _task_id: &str,
        name: &str,
        input: serde_json::Value,
        _compute: StepFn,
    ) -> Result<serde_json::Value, TaskError> {
        self.inner.step(&self.workflow_instance_id, name, input).await
    }

    async fn sleep(&self, _task_id: &str, name: &str, duration: Duration) -> Result<(), TaskError> {
        self.inner.sleep(&self.workflow_instance_id, name, duration).await
    }

    async fn wait_for_event(
        &self,
        _task_id: &str,
        name: &str,
        event_type: &str,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, TaskError> {
        self.inner
            .wait_for_event(&self.workflow_instance_id, name, event_type, timeout)
            .await
    }
}

/// Test double: steps memoize by name within one instance id (a stand-in
/// for replay-idempotency); events are delivered by test code calling
/// [`Self::deliver_event`], unblocking any matching `wait_for_event`.
#[derive(Default)]
pub struct InMemoryDurableStepExecutor {
    steps: Mutex<HashMap<String, serde_json::Value>>,
    events: Mutex<HashMap<String, serde_json::Value>>,
    notify: Notify,
}

impl InMemoryDurableStepExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn deliver_event(&self, event_type: &str, payload: serde_json::Value) {
        self.events.lock().await.insert(event_type.to_string(), payload);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl DurableStepExecutor for InMemoryDurableStepExecutor {
    async fn step(
        &self,
        _workflow_instance_id: &str,
        name: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, TaskError> {
        let mut steps = self.steps.lock().await;
        if let Some(memoized) = steps.get(name) {
            return Ok(memoized.clone());
        }
        steps.insert(name.to_string(), input.clone());
        Ok(input)
    }

    async fn sleep(&self, _workflow_instance_id: &str, _name: &str, duration: Duration) -> Result<(), TaskError> {
        tokio::time::sleep(duration).await;
        Ok(())
    }

    async fn wait_for_event(
        &self,
        _workflow_instance_id: &str,
        _name: &str,
        event_type: &str,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, TaskError> {
        loop {
            if let Some(payload) = self.events.lock().await.remove(event_type) {
                return Ok(payload);
            }
            let wait = self.notify.notified();
            match timeout {
                Some(d) => {
                    if tokio::time::timeout(d, wait).await.is_err() {
                        return Err(TaskError::NotFound(format!("event {event_type} timed out")));
                    }
                }
                None => wait.await,
            }
        }
    }

    async fn terminate(&self, _workflow_instance_id: &str) -> Result<(), TaskError> {
        Ok(())
    }
}
