//! Per-agent embedded SQL store.
//!
//! Every agent instance owns exactly one SQLite database. All reserved
//! tables carry the `cf_agents_` prefix (voice-specific tables carry
//! `cf_voice_`) so user-defined tables created by a workload can never
//! collide with the runtime's own schema. Every access funnels through
//! [`tokio::task::block_in_place`], the same pattern the teacher's
//! workspace store uses to call synchronous `rusqlite` from async
//! actor code without blocking the executor's other tasks.

mod messages;
mod schedules;
mod sessions;
mod state;
mod tasks;

pub use messages::StoredMessage;
pub use schedules::{ScheduleKind, StoredSchedule};
pub use sessions::StoredEvent;
pub use tasks::{StoredTask, TaskStatus};

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cf_agents_state (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    state TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS cf_agents_messages (
    id TEXT PRIMARY KEY,
    role TEXT NOT NULL,
    parts TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    seq INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS cf_agents_schedules (
    id TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    callback_method TEXT NOT NULL,
    kind TEXT NOT NULL,
    time INTEGER NOT NULL,
    delay_secs INTEGER,
    cron TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cf_agents_schedules_time ON cf_agents_schedules(time);
CREATE TABLE IF NOT EXISTS cf_agents_tasks (
    id TEXT PRIMARY KEY,
    method TEXT NOT NULL,
    input TEXT NOT NULL,
    status TEXT NOT NULL,
    result TEXT,
    error TEXT,
    events TEXT NOT NULL,
    progress INTEGER,
    timeout_ms INTEGER,
    deadline_at INTEGER,
    durable INTEGER NOT NULL,
    workflow_instance_id TEXT,
    current_step TEXT,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_cf_agents_tasks_status ON cf_agents_tasks(status);
CREATE INDEX IF NOT EXISTS idx_cf_agents_tasks_durable ON cf_agents_tasks(durable);
CREATE TABLE IF NOT EXISTS cf_agents_sessions (
    id TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS cf_agents_events (
    session_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    action TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (session_id, seq)
);
CREATE INDEX IF NOT EXISTS idx_cf_agents_events_session_seq ON cf_agents_events(session_id, seq);
"#;

/// A single agent instance's SQL store. Cheap to clone — the connection is
/// behind an `Arc<Mutex<_>>`, matched to the actor's single-writer
/// invariant rather than to concurrent access (only the actor's own task
/// ever calls in, but the handle is still `Send + Sync` for convenience).
#[derive(Clone)]
pub struct AgentStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl AgentStore {
    /// Opens (creating if absent) the database at `path` and ensures the
    /// reserved schema exists. Additive `ALTER TABLE` migrations belong
    /// here as the schema grows; today's schema is version 1.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(path.as_ref())
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory store. Used by tests and by instances that opt
    /// out of durability (not a spec requirement, but a convenient escape
    /// hatch with the same code path as the durable case).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Storage("store mutex poisoned".into()))
    }

    /// Runs an arbitrary query against the underlying connection. This is
    /// the escape hatch a workload uses for its own tables; the runtime
    /// itself only ever touches the reserved tables above.
    pub async fn sql<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T, StoreError> + Send,
        T: Send,
    {
        let this = self.clone();
        tokio::task::block_in_place(move || {
            let conn = this.lock()?;
            f(&conn)
        })
    }
}
