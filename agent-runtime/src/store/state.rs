//! The single-row `cf_agents_state` table: the agent's authoritative,
//! broadcastable state blob.

use rusqlite::params;

use crate::error::StoreError;
use crate::store::AgentStore;

impl AgentStore {
    /// Reads the current state row, defaulting to `null` if the agent has
    /// never called `setState`.
    pub async fn get_state(&self) -> Result<serde_json::Value, StoreError> {
        self.sql(|conn| {
            let row: Option<String> = conn
                .query_row(
                    "SELECT state FROM cf_agents_state WHERE id = 0",
                    [],
                    |row| row.get(0),
                )
                .ok();
            match row {
                Some(text) => serde_json::from_str(&text)
                    .map_err(|e| StoreError::Serialization(e.to_string())),
                None => Ok(serde_json::Value::Null),
            }
        })
        .await
    }

    /// Writes the state row. This is the write half of invariant 3.3:
    /// the caller is expected to broadcast the same value it just wrote,
    /// atomically with respect to other writers, which holds here because
    /// only the owning actor ever calls this.
    pub async fn set_state(&self, next: serde_json::Value) -> Result<(), StoreError> {
        let text = serde_json::to_string(&next).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.sql(move |conn| {
            conn.execute(
                "INSERT INTO cf_agents_state (id, state) VALUES (0, ?1)
                 ON CONFLICT(id) DO UPDATE SET state = excluded.state",
                params![text],
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn defaults_to_null() {
        let store = AgentStore::open_in_memory().unwrap();
        assert_eq!(store.get_state().await.unwrap(), serde_json::Value::Null);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn set_then_get_roundtrips() {
        let store = AgentStore::open_in_memory().unwrap();
        store.set_state(serde_json::json!({"n": 1})).await.unwrap();
        assert_eq!(store.get_state().await.unwrap(), serde_json::json!({"n": 1}));
        store.set_state(serde_json::json!({"n": 2})).await.unwrap();
        assert_eq!(store.get_state().await.unwrap(), serde_json::json!({"n": 2}));
    }
}
