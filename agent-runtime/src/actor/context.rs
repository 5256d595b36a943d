//! The actor's current-call context and state-mutation entry point.

use std::sync::{Arc, Mutex};

use agent_wire::ServerFrame;

use crate::actor::connection::{ConnectionId, ConnectionRegistry};
use crate::actor::{Agent, StateUpdateSource};
use crate::chat::ChatEngine;
use crate::error::AgentError;
use crate::scheduler::SchedulerHandle;
use crate::store::AgentStore;
use crate::tasks::TaskTracker;

/// What's executing right now, readable by any handler code running on the
/// actor's behalf instead of threading a handle through every call (§4.1).
#[derive(Clone, Default)]
pub struct CurrentCall {
    pub connection: Option<ConnectionId>,
    pub request_path: Option<String>,
}

/// Everything one live agent instance needs to run: its store, its
/// connections, its scheduler handle, and a reference back to the agent
/// implementation so that state mutation can invoke `on_state_update`.
pub struct ActorContext {
    pub class: String,
    pub name: String,
    pub store: AgentStore,
    pub connections: ConnectionRegistry,
    pub scheduler: SchedulerHandle,
    pub tasks: TaskTracker,
    pub chat: ChatEngine,
    agent: Arc<dyn Agent>,
    current: Mutex<CurrentCall>,
}

impl ActorContext {
    pub fn new(
        class: String,
        name: String,
        store: AgentStore,
        scheduler: SchedulerHandle,
        agent: Arc<dyn Agent>,
    ) -> Self {
        Self {
            class,
            name,
            store,
            connections: ConnectionRegistry::new(),
            scheduler,
            tasks: TaskTracker::new(),
            chat: ChatEngine::new(),
            agent,
            current: Mutex::new(CurrentCall::default()),
        }
    }

    pub fn current_call(&self) -> CurrentCall {
        self.current.lock().expect("current call mutex poisoned").clone()
    }

    pub(crate) fn set_current_call(&self, call: CurrentCall) {
        *self.current.lock().expect("current call mutex poisoned") = call;
    }

    /// `setState` (§4.1): write the row, broadcast the new value to every
    /// attached connection, then invoke `onStateUpdate`. Two calls in the
    /// same handler each durably write, but only the last value is what
    /// gets broadcast and observed by `onStateUpdate` — callers that want
    /// every intermediate value seen by clients must broadcast themselves.
    pub async fn set_state(
        &self,
        next: serde_json::Value,
        source: StateUpdateSource,
    ) -> Result<(), AgentError> {
        let prev = self.store.get_state().await?;
        self.store.set_state(next.clone()).await?;
        self.connections
            .broadcast(ServerFrame::CfAgentState {
                state: next.clone(),
            })
            .await;
        self.agent.on_state_update(self, prev, next, source).await
    }

    pub async fn get_state(&self) -> Result<serde_json::Value, AgentError> {
        Ok(self.store.get_state().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ConnectRequest;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingAgent {
        updates: AtomicUsize,
    }

    #[async_trait]
    impl Agent for RecordingAgent {
        async fn on_state_update(
            &self,
            _ctx: &ActorContext,
            _prev: serde_json::Value,
            _next: serde_json::Value,
            _source: StateUpdateSource,
        ) -> Result<(), AgentError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn set_state_writes_broadcasts_and_invokes_callback() {
        let store = AgentStore::open_in_memory().unwrap();
        let scheduler = SchedulerHandle::new_detached();
        let agent = Arc::new(RecordingAgent {
            updates: AtomicUsize::new(0),
        });
        let ctx = ActorContext::new("demo".into(), "x".into(), store, scheduler, agent.clone());
        ctx.set_state(serde_json::json!({"n": 1}), StateUpdateSource::Server)
            .await
            .unwrap();
        assert_eq!(ctx.get_state().await.unwrap(), serde_json::json!({"n": 1}));
        assert_eq!(agent.updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn current_call_defaults_empty() {
        let store_fut = AgentStore::open_in_memory().unwrap();
        let scheduler = SchedulerHandle::new_detached();
        let agent = Arc::new(RecordingAgent {
            updates: AtomicUsize::new(0),
        });
        let ctx = ActorContext::new("demo".into(), "x".into(), store_fut, scheduler, agent);
        assert!(ctx.current_call().connection.is_none());
        let _ = ConnectRequest {
            path: "/agents/demo/x".into(),
        };
    }
}
