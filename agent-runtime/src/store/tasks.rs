//! The `cf_agents_tasks` table backing the task system (§4.5).

use rusqlite::params;

use crate::error::StoreError;
use crate::store::AgentStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
    Waiting,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Aborted => "aborted",
            TaskStatus::Waiting => "waiting",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "aborted" => Ok(TaskStatus::Aborted),
            "waiting" => Ok(TaskStatus::Waiting),
            other => Err(StoreError::Storage(format!("unknown task status {other}"))),
        }
    }

    /// Terminal statuses never transition again (testable property 4).
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Aborted)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoredTask {
    pub id: String,
    pub method: String,
    pub input: serde_json::Value,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub events: serde_json::Value,
    pub progress: Option<i64>,
    pub timeout_ms: Option<i64>,
    pub deadline_at: Option<i64>,
    pub durable: bool,
    pub workflow_instance_id: Option<String>,
    pub current_step: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<StoredTaskRaw> {
    Ok(StoredTaskRaw {
        id: row.get(0)?,
        method: row.get(1)?,
        input: row.get(2)?,
        status: row.get(3)?,
        result: row.get(4)?,
        error: row.get(5)?,
        events: row.get(6)?,
        progress: row.get(7)?,
        timeout_ms: row.get(8)?,
        deadline_at: row.get(9)?,
        durable: row.get(10)?,
        workflow_instance_id: row.get(11)?,
        current_step: row.get(12)?,
        created_at: row.get(13)?,
        started_at: row.get(14)?,
        completed_at: row.get(15)?,
    })
}

struct StoredTaskRaw {
    id: String,
    method: String,
    input: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    events: String,
    progress: Option<i64>,
    timeout_ms: Option<i64>,
    deadline_at: Option<i64>,
    durable: bool,
    workflow_instance_id: Option<String>,
    current_step: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

fn to_stored(raw: StoredTaskRaw) -> Result<StoredTask, StoreError> {
    Ok(StoredTask {
        id: raw.id,
        method: raw.method,
        input: serde_json::from_str(&raw.input).map_err(|e| StoreError::Serialization(e.to_string()))?,
        status: TaskStatus::parse(&raw.status)?,
        result: raw
            .result
            .map(|t| serde_json::from_str(&t))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        error: raw.error,
        events: serde_json::from_str(&raw.events).map_err(|e| StoreError::Serialization(e.to_string()))?,
        progress: raw.progress,
        timeout_ms: raw.timeout_ms,
        deadline_at: raw.deadline_at,
        durable: raw.durable,
        workflow_instance_id: raw.workflow_instance_id,
        current_step: raw.current_step,
        created_at: raw.created_at,
        started_at: raw.started_at,
        completed_at: raw.completed_at,
    })
}

impl AgentStore {
    pub async fn insert_task(&self, task: StoredTask) -> Result<(), StoreError> {
        let input_text = serde_json::to_string(&task.input).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let events_text = serde_json::to_string(&task.events).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.sql(move |conn| {
            conn.execute(
                "INSERT INTO cf_agents_tasks
                 (id, method, input, status, result, error, events, progress, timeout_ms,
                  deadline_at, durable, workflow_instance_id, current_step, created_at,
                  started_at, completed_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
                params![
                    task.id,
                    task.method,
                    input_text,
                    task.status.as_str(),
                    task.result.as_ref().map(|v| v.to_string()),
                    task.error,
                    events_text,
                    task.progress,
                    task.timeout_ms,
                    task.deadline_at,
                    task.durable,
                    task.workflow_instance_id,
                    task.current_step,
                    task.created_at,
                    task.started_at,
                    task.completed_at,
                ],
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<StoredTask>, StoreError> {
        let id = id.to_string();
        self.sql(move |conn| {
            conn.query_row(
                "SELECT id, method, input, status, result, error, events, progress, timeout_ms,
                        deadline_at, durable, workflow_instance_id, current_step, created_at,
                        started_at, completed_at
                 FROM cf_agents_tasks WHERE id = ?1",
                params![id],
                row_to_task,
            )
            .ok()
            .map(to_stored)
            .transpose()
        })
        .await
    }

    pub async fn list_tasks(&self) -> Result<Vec<StoredTask>, StoreError> {
        self.sql(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, method, input, status, result, error, events, progress, timeout_ms,
                            deadline_at, durable, workflow_instance_id, current_step, created_at,
                            started_at, completed_at
                     FROM cf_agents_tasks ORDER BY created_at ASC",
                )
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map([], row_to_task)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(to_stored(row.map_err(|e| StoreError::Storage(e.to_string()))?)?);
            }
            Ok(out)
        })
        .await
    }

    /// Overwrites the mutable columns of a task row. Status-machine
    /// legality is enforced by the task tracker before calling this; the
    /// store layer persists whatever it is told.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_task(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        events: serde_json::Value,
        progress: Option<i64>,
        started_at: Option<i64>,
        completed_at: Option<i64>,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        let result_text = result.map(|v| v.to_string());
        let events_text = serde_json::to_string(&events).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.sql(move |conn| {
            conn.execute(
                "UPDATE cf_agents_tasks SET status=?1, result=?2, error=?3, events=?4,
                 progress=?5, started_at=COALESCE(?6, started_at), completed_at=?7 WHERE id=?8",
                params![
                    status.as_str(),
                    result_text,
                    error,
                    events_text,
                    progress,
                    started_at,
                    completed_at,
                    id
                ],
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
    }
}
