//! The Task System (§4.5): typed background jobs, observable via events and
//! progress, cancellable, with an optional durable-execution mode. `step`,
//! `sleep`, and `waitForEvent` are all routed through one [`StepExecutor`]
//! interface so a task body reads the same regardless of which mode it
//! runs under; only [`TaskContext`] itself knows which status transitions
//! that implies.

pub mod durable;
pub mod ephemeral;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::actor::ActorContext;
use crate::error::{AgentError, TaskError};
use crate::store::{StoredTask, TaskStatus};

pub use durable::{DurableExecutorAdapter, DurableStepExecutor, InMemoryDurableStepExecutor};
pub use ephemeral::EphemeralExecutor;

pub type StepFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, TaskError>> + Send>>;
pub type StepFn = Box<dyn FnOnce() -> StepFuture + Send>;

/// What `step`/`sleep`/`waitForEvent` actually run against. Ephemeral tasks
/// get [`ephemeral::EphemeralExecutor`]; durable tasks get a
/// [`DurableExecutorAdapter`] wrapping the external capability.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn step(
        &self,
        task_id: &str,
        name: &str,
        input: serde_json::Value,
        compute: StepFn,
    ) -> Result<serde_json::Value, TaskError>;

    async fn sleep(&self, task_id: &str, name: &str, duration: Duration) -> Result<(), TaskError>;

    async fn wait_for_event(
        &self,
        task_id: &str,
        name: &str,
        event_type: &str,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, TaskError>;
}

/// A task body: `run` is handed everything §4.5 promises a task context —
/// `taskId` and the abort signal live on [`TaskContext`] directly, `emit`/
/// `setProgress`/`step`/`sleep`/`waitForEvent` are its methods.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(
        &self,
        ctx: Arc<ActorContext>,
        task: TaskContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, AgentError>;
}

fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<(), TaskError> {
    use TaskStatus::*;
    let legal = matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Aborted)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Aborted)
            | (Running, Waiting)
            | (Waiting, Running)
            | (Waiting, Aborted)
    );
    if legal {
        Ok(())
    } else {
        Err(TaskError::IllegalTransition {
            from: from.as_str().into(),
            to: to.as_str().into(),
        })
    }
}

/// Everything a task body can reach: its id, its abort signal, and the
/// step/sleep/waitForEvent surface. `durable` gates whether `sleep`/
/// `waitForEvent` pass the task through `waiting` — ephemeral tasks never
/// enter that status (§4.5's status diagram marks it durable-only).
pub struct TaskContext {
    pub task_id: String,
    pub cancel: CancellationToken,
    ctx: Arc<ActorContext>,
    executor: Arc<dyn StepExecutor>,
    durable: bool,
}

impl TaskContext {
    async fn current(&self) -> Result<StoredTask, TaskError> {
        self.ctx
            .store
            .get_task(&self.task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound(self.task_id.clone()))
    }

    /// Appends an event row and broadcasts the updated task into the
    /// agent's state (§4.5: "append an event row and broadcast via state
    /// mirror").
    pub async fn emit(&self, event_type: &str, data: serde_json::Value) -> Result<(), TaskError> {
        let mut task = self.current().await?;
        let mut events = task.events.as_array().cloned().unwrap_or_default();
        events.push(serde_json::json!({"type": event_type, "data": data}));
        task.events = serde_json::Value::Array(events);
        self.ctx
            .store
            .update_task(
                &self.task_id,
                task.status,
                task.result.clone(),
                task.error.clone(),
                task.events.clone(),
                task.progress,
                None,
                None,
            )
            .await?;
        mirror_task(&self.ctx, &task).await;
        Ok(())
    }

    /// Clamps to `[0, 100]`; calling it repeatedly with the same value is a
    /// no-op write, not an error (§4.5: "idempotent, clamped").
    pub async fn set_progress(&self, n: i64) -> Result<(), TaskError> {
        let clamped = n.clamp(0, 100);
        let mut task = self.current().await?;
        task.progress = Some(clamped);
        self.ctx
            .store
            .update_task(
                &self.task_id,
                task.status,
                task.result.clone(),
                task.error.clone(),
                task.events.clone(),
                Some(clamped),
                None,
                None,
            )
            .await?;
        mirror_task(&self.ctx, &task).await;
        Ok(())
    }

    pub async fn step(
        &self,
        name: &str,
        input: serde_json::Value,
        compute: StepFn,
    ) -> Result<serde_json::Value, TaskError> {
        self.executor.step(&self.task_id, name, input, compute).await
    }

    pub async fn sleep(&self, name: &str, duration: Duration) -> Result<(), TaskError> {
        if self.durable {
            self.set_status(TaskStatus::Waiting).await?;
        }
        let result = self.executor.sleep(&self.task_id, name, duration).await;
        if self.durable {
            self.set_status(TaskStatus::Running).await?;
        }
        result
    }

    /// Ephemeral tasks fail fast (§4.5: "durable mode only").
    pub async fn wait_for_event(
        &self,
        name: &str,
        event_type: &str,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, TaskError> {
        if !self.durable {
            return Err(TaskError::EphemeralCannotWait);
        }
        self.set_status(TaskStatus::Waiting).await?;
        let result = self.executor.wait_for_event(&self.task_id, name, event_type, timeout).await;
        self.set_status(TaskStatus::Running).await?;
        result
    }

    async fn set_status(&self, status: TaskStatus) -> Result<(), TaskError> {
        let mut task = self.current().await?;
        validate_transition(task.status, status)?;
        self.ctx
            .store
            .update_task(
                &self.task_id,
                status,
                task.result.clone(),
                task.error.clone(),
                task.events.clone(),
                task.progress,
                None,
                None,
            )
            .await?;
        task.status = status;
        mirror_task(&self.ctx, &task).await;
        Ok(())
    }
}

/// Merges a task's observable fields into the agent's state under a
/// reserved `tasks` key and broadcasts it the same way any other
/// `setState` call would (§4.5: "the task tracker mirrors these into the
/// agent's state"). Best-effort: the task row itself is already durably
/// written, so a mirror failure is logged rather than surfaced to the
/// caller.
async fn mirror_task(ctx: &Arc<ActorContext>, task: &StoredTask) {
    let current = ctx.get_state().await.unwrap_or(serde_json::json!({}));
    let mut state = match current {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    let tasks_entry = state
        .entry("tasks")
        .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    if !tasks_entry.is_object() {
        *tasks_entry = serde_json::Value::Object(serde_json::Map::new());
    }
    if let serde_json::Value::Object(tasks) = tasks_entry {
        tasks.insert(
            task.id.clone(),
            serde_json::json!({
                "status": task.status.as_str(),
                "progress": task.progress,
                "result": task.result,
                "error": task.error,
                "events": task.events,
            }),
        );
    }
    if let Err(e) = ctx
        .set_state(serde_json::Value::Object(state), crate::actor::StateUpdateSource::Server)
        .await
    {
        tracing::warn!(task_id = %task.id, error = %e, "failed to mirror task into agent state");
    }
}

/// A running task's in-process abort handle, plus (for durable tasks
/// handed to an external backend) the capability to ask that backend to
/// terminate the backing workflow instance on cancel (§4.5).
#[derive(Clone)]
struct TaskController {
    cancel: CancellationToken,
    durable_backend: Option<(Arc<dyn DurableStepExecutor>, String)>,
}

/// Owns the in-process abort handles for every task currently running on
/// this instance. Cheap to clone; the map lives behind an `Arc<Mutex<_>>`
/// so the actor's own calls (start/cancel) and a task's own background
/// completion future can both reach it.
#[derive(Clone, Default)]
pub struct TaskTracker {
    controllers: Arc<Mutex<HashMap<String, TaskController>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        &self,
        ctx: Arc<ActorContext>,
        handler: Arc<dyn TaskHandler>,
        method: String,
        input: serde_json::Value,
        durable: bool,
        timeout_ms: Option<i64>,
        executor: Arc<dyn StepExecutor>,
        durable_backend: Option<(Arc<dyn DurableStepExecutor>, String)>,
    ) -> Result<String, TaskError> {
        let now = chrono::Utc::now().timestamp();
        let id = Uuid::new_v4().to_string();
        let row = StoredTask {
            id: id.clone(),
            method,
            input: input.clone(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            events: serde_json::json!([]),
            progress: None,
            timeout_ms,
            deadline_at: timeout_ms.map(|ms| now + ms / 1000),
            durable,
            workflow_instance_id: durable_backend.as_ref().map(|(_, id)| id.clone()),
            current_step: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        ctx.store.insert_task(row).await?;
        let cancel = CancellationToken::new();
        self.controllers.lock().await.insert(
            id.clone(),
            TaskController {
                cancel: cancel.clone(),
                durable_backend,
            },
        );

        // Timeouts run from this point, not from task creation (§4.5).
        let started_at = chrono::Utc::now().timestamp();
        validate_transition(TaskStatus::Pending, TaskStatus::Running)?;
        ctx.store
            .update_task(
                &id,
                TaskStatus::Running,
                None,
                None,
                serde_json::json!([]),
                None,
                Some(started_at),
                None,
            )
            .await?;

        let task_ctx = TaskContext {
            task_id: id.clone(),
            cancel: cancel.clone(),
            ctx: ctx.clone(),
            executor,
            durable,
        };

        let tracker = self.clone();
        let ctx2 = ctx.clone();
        let id2 = id.clone();
        tokio::spawn(async move {
            let run = handler.run(ctx2.clone(), task_ctx, input);
            let outcome = match timeout_ms {
                Some(ms) => {
                    tokio::select! {
                        res = run => res,
                        _ = tokio::time::sleep(Duration::from_millis(ms as u64)) => {
                            Err(AgentError::Timeout(format!("task {id2} exceeded {ms}ms")))
                        }
                        _ = cancel.cancelled() => Err(AgentError::Internal("task aborted".into())),
                    }
                }
                None => {
                    tokio::select! {
                        res = run => res,
                        _ = cancel.cancelled() => Err(AgentError::Internal("task aborted".into())),
                    }
                }
            };
            tracker.finish(&ctx2, &id2, outcome).await;
        });

        Ok(id)
    }

    async fn finish(&self, ctx: &Arc<ActorContext>, id: &str, outcome: Result<serde_json::Value, AgentError>) {
        self.controllers.lock().await.remove(id);
        let task = match ctx.store.get_task(id).await {
            Ok(Some(t)) => t,
            _ => return,
        };
        if task.status.is_terminal() {
            return;
        }
        let completed_at = chrono::Utc::now().timestamp();
        let (status, result, error) = match outcome {
            Ok(value) => (TaskStatus::Completed, Some(value), None),
            Err(e) => (TaskStatus::Failed, None, Some(e.to_string())),
        };
        let _ = ctx
            .store
            .update_task(
                id,
                status,
                result.clone(),
                error.clone(),
                task.events.clone(),
                task.progress,
                None,
                Some(completed_at),
            )
            .await;
        let mut finished = task;
        finished.status = status;
        finished.result = result;
        finished.error = error;
        mirror_task(ctx, &finished).await;
    }

    /// `cancel(taskId)`: aborts the in-process controller, asks a durable
    /// backend (if any) to terminate the backing instance, and records
    /// `aborted`. A no-op on an already-terminal task (§4.5: "non-terminal
    /// tasks only").
    pub async fn cancel(&self, ctx: &Arc<ActorContext>, id: &str) -> Result<(), TaskError> {
        let mut task = ctx
            .store
            .get_task(id)
            .await?
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        if task.status.is_terminal() {
            return Ok(());
        }
        let controller = self.controllers.lock().await.get(id).cloned();
        if let Some(controller) = &controller {
            controller.cancel.cancel();
            if let Some((backend, workflow_instance_id)) = &controller.durable_backend {
                if let Err(e) = backend.terminate(workflow_instance_id).await {
                    tracing::warn!(task_id = %id, error = %e, "failed to terminate durable backend instance");
                }
            }
        }
        validate_transition(task.status, TaskStatus::Aborted)?;
        ctx.store
            .update_task(
                id,
                TaskStatus::Aborted,
                task.result.clone(),
                Some("cancelled".into()),
                task.events.clone(),
                task.progress,
                None,
                Some(chrono::Utc::now().timestamp()),
            )
            .await?;
        task.status = TaskStatus::Aborted;
        task.error = Some("cancelled".into());
        mirror_task(ctx, &task).await;
        Ok(())
    }

    /// Drops any in-process controller whose task already reached a
    /// terminal state (or vanished) without going through [`Self::finish`]
    /// — called once per actor step (§4.5: "reaped on every actor step").
    pub async fn reap_orphans(&self, ctx: &Arc<ActorContext>) {
        let ids: Vec<String> = self.controllers.lock().await.keys().cloned().collect();
        for id in ids {
            let drop_it = match ctx.store.get_task(&id).await {
                Ok(Some(task)) => task.status.is_terminal(),
                Ok(None) => true,
                Err(_) => false,
            };
            if drop_it {
                self.controllers.lock().await.remove(&id);
            }
        }
    }

    /// The reserved `handleWorkflowUpdate({ taskId, event?, progress?,
    /// status?, result?, error? })` method (§4.5): a durable-step executor
    /// reports status back through this, and the tracker mirrors whatever
    /// changed into the agent's state. Only the fields present in `update`
    /// are applied; everything else on the task row is left untouched.
    pub async fn handle_workflow_update(
        &self,
        ctx: &Arc<ActorContext>,
        update: WorkflowUpdate,
    ) -> Result<(), TaskError> {
        let mut task = ctx
            .store
            .get_task(&update.task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound(update.task_id.clone()))?;

        if let Some(event) = update.event {
            let mut events = task.events.as_array().cloned().unwrap_or_default();
            events.push(event);
            task.events = serde_json::Value::Array(events);
        }
        if let Some(progress) = update.progress {
            task.progress = Some(progress.clamp(0, 100));
        }
        if let Some(result) = update.result {
            task.result = Some(result);
        }
        if let Some(error) = update.error {
            task.error = Some(error);
        }
        if let Some(status) = update.status {
            let parsed = TaskStatus::parse(&status)?;
            validate_transition(task.status, parsed)?;
            task.status = parsed;
        }
        let completed_at = task.status.is_terminal().then(|| chrono::Utc::now().timestamp());

        ctx.store
            .update_task(
                &update.task_id,
                task.status,
                task.result.clone(),
                task.error.clone(),
                task.events.clone(),
                task.progress,
                None,
                completed_at,
            )
            .await?;

        if task.status.is_terminal() {
            self.controllers.lock().await.remove(&update.task_id);
        }

        mirror_task(ctx, &task).await;
        Ok(())
    }
}

/// What a durable-step executor reports back through `handleWorkflowUpdate`
/// (§4.5). Every field but `task_id` is optional; absent fields leave the
/// corresponding column untouched.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct WorkflowUpdate {
    pub task_id: String,
    #[serde(default)]
    pub event: Option<serde_json::Value>,
    #[serde(default)]
    pub progress: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}
