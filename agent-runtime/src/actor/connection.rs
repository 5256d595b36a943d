//! Attached connections: per-connection state bag, tags, and outbound
//! sender, all owned by the actor while attached (§3.4).

use std::collections::HashMap;

use agent_wire::ServerFrame;
use dashmap::DashMap;
use tokio::sync::mpsc;

pub type ConnectionId = String;

/// One live duplex connection attached to an instance. `outbound` delivers
/// frames to whatever transport (websocket write half, mock sender in
/// tests) actually owns the socket; the actor only ever pushes frames,
/// never reads the socket directly.
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub tags: Vec<String>,
    pub state: HashMap<String, serde_json::Value>,
    pub outbound: mpsc::Sender<ServerFrame>,
}

impl ConnectionInfo {
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            id,
            tags: Vec::new(),
            state: HashMap::new(),
            outbound,
        }
    }

    pub async fn send(&self, frame: ServerFrame) -> bool {
        self.outbound.send(frame).await.is_ok()
    }
}

/// Every connection currently attached to one actor. A plain `DashMap`
/// keyed by connection id; mutation only ever happens on the actor's own
/// task, matching the single-writer rule, but the map is `Sync` so a
/// connection's read-side task can still look itself up to drop cleanly.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionInfo>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: ConnectionInfo) {
        self.connections.insert(conn.id.clone(), conn);
    }

    pub fn remove(&self, id: &str) -> Option<ConnectionInfo> {
        self.connections.remove(id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Broadcasts a frame to every attached connection, dropping ones
    /// whose outbound channel has gone away (the transport task will
    /// clean up the registry entry itself on close).
    pub async fn broadcast(&self, frame: ServerFrame) {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some(conn) = self.connections.get(&id) {
                let _ = conn.outbound.send(frame.clone()).await;
            }
        }
    }

    pub async fn send_to(&self, id: &str, frame: ServerFrame) -> bool {
        match self.connections.get(id) {
            Some(conn) => conn.outbound.send(frame).await.is_ok(),
            None => false,
        }
    }

    /// Broadcasts to every attached connection except `exclude`, for the
    /// "forward to the requester, broadcast to everyone else" delivery
    /// split (§4.4 step 3).
    pub async fn broadcast_except(&self, exclude: &str, frame: ServerFrame) {
        let ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| id != exclude)
            .collect();
        for id in ids {
            if let Some(conn) = self.connections.get(&id) {
                let _ = conn.outbound.send(frame.clone()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_every_connection() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        registry.insert(ConnectionInfo::new("a".into(), tx1));
        registry.insert(ConnectionInfo::new("b".into(), tx2));
        registry
            .broadcast(ServerFrame::CfAgentState {
                state: serde_json::json!({"n": 1}),
            })
            .await;
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn broadcast_except_skips_the_excluded_connection() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        registry.insert(ConnectionInfo::new("a".into(), tx1));
        registry.insert(ConnectionInfo::new("b".into(), tx2));
        registry
            .broadcast_except(
                "a",
                ServerFrame::CfAgentState {
                    state: serde_json::json!({"n": 1}),
                },
            )
            .await;
        assert!(rx2.recv().await.is_some());
        drop(registry);
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn remove_drops_entry() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        registry.insert(ConnectionInfo::new("a".into(), tx));
        assert_eq!(registry.len(), 1);
        registry.remove("a");
        assert!(registry.is_empty());
    }
}
