//! Class registry and live-instance admission (§4.2 "Admission").
//!
//! Generalizes the teacher's single fixed workload (`serve/src/app.rs`'s
//! one `AppState` wired to one hardcoded run path) to an arbitrary number
//! of agent classes, each a factory the host process registers before
//! `run_server` starts accepting connections.

use std::path::PathBuf;
use std::sync::Arc;

use agent_runtime::actor::{spawn_actor, Agent, ActorHandle};
use agent_runtime::error::AgentError;
use agent_runtime::store::AgentStore;
use dashmap::DashMap;
use tokio::sync::Mutex;

pub type AgentFactory = Arc<dyn Fn() -> Arc<dyn Agent> + Send + Sync>;

/// Registered agent classes, live instance cache, and the directory each
/// instance's embedded store lives under (`<store_dir>/<class>/<name>.sqlite3`).
pub struct ServerState {
    pub prefix: String,
    store_dir: PathBuf,
    classes: DashMap<String, AgentFactory>,
    instances: DashMap<(String, String), ActorHandle>,
    // Serializes the check-then-spawn sequence in `admit` so two requests
    // racing to address the same new instance can't open the same sqlite
    // file twice or leak a spawned actor task whose handle is discarded.
    admission_lock: Mutex<()>,
}

impl ServerState {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            prefix: "agents".to_string(),
            store_dir: store_dir.into(),
            classes: DashMap::new(),
            instances: DashMap::new(),
            admission_lock: Mutex::new(()),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn register_class(&self, class: impl Into<String>, factory: AgentFactory) {
        self.classes.insert(class.into(), factory);
    }

    /// Resolves `(class, name)` to a live actor, spawning one on first
    /// address. An instance, once spawned, persists for the life of the
    /// process (§4.1 "created on first address and persists indefinitely").
    pub async fn admit(&self, class: &str, name: &str) -> Result<ActorHandle, AgentError> {
        let key = (class.to_string(), name.to_string());
        if let Some(handle) = self.instances.get(&key) {
            return Ok(handle.clone());
        }

        let _guard = self.admission_lock.lock().await;
        if let Some(handle) = self.instances.get(&key) {
            return Ok(handle.clone());
        }

        let factory = self
            .classes
            .get(class)
            .ok_or_else(|| AgentError::NotFound(format!("unknown agent class: {class}")))?
            .clone();

        let path = self.store_dir.join(class).join(format!("{name}.sqlite3"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::Internal(format!("creating store dir: {e}")))?;
        }
        let store = AgentStore::open(&path)?;
        let agent = factory();
        let handle = spawn_actor(class.to_string(), name.to_string(), store, agent).await;
        self.instances.insert(key, handle.clone());
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_runtime::actor::ActorContext;
    use async_trait::async_trait;

    struct NoopAgent;

    #[async_trait]
    impl Agent for NoopAgent {
        async fn on_connect(
            &self,
            _ctx: &ActorContext,
            _conn_id: &agent_runtime::actor::ConnectionId,
        ) -> Result<(), AgentError> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn admit_spawns_once_and_reuses_instance() {
        let dir = tempfile::tempdir().unwrap();
        let state = ServerState::new(dir.path());
        state.register_class("demo", Arc::new(|| Arc::new(NoopAgent) as Arc<dyn Agent>));

        let a = state.admit("demo", "room-1").await.unwrap();
        let b = state.admit("demo", "room-1").await.unwrap();
        // Same (class, name) resolves to the same mailbox: sending through
        // either handle lands in the same actor.
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        a.connect(agent_runtime::actor::ConnectRequest::default(), tx.clone())
            .await
            .unwrap();
        drop(tx);
        drop(rx.recv().await);
        drop(b);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn admit_unknown_class_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = ServerState::new(dir.path());
        let err = state.admit("missing", "x").await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }
}
