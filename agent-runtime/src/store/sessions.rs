//! The `cf_agents_sessions` / `cf_agents_events` tables backing the
//! optional session/event primitive (§4.7).

use rusqlite::params;

use crate::error::StoreError;
use crate::store::AgentStore;

#[derive(Clone, Debug, PartialEq)]
pub struct StoredEvent {
    pub session_id: String,
    pub seq: i64,
    pub action: String,
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

impl AgentStore {
    pub async fn ensure_session(&self, session_id: &str, created_at: i64) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.sql(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO cf_agents_sessions (id, created_at) VALUES (?1, ?2)",
                params![session_id, created_at],
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
    }

    /// Appends one event, assigning it the next `seq` for its session.
    /// Called once per event under the actor's single-writer context, so
    /// there is no race between reading the max and inserting the next.
    pub async fn append_event(
        &self,
        session_id: &str,
        action: &str,
        metadata: serde_json::Value,
        created_at: i64,
    ) -> Result<i64, StoreError> {
        let session_id = session_id.to_string();
        let action = action.to_string();
        let metadata_text =
            serde_json::to_string(&metadata).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.sql(move |conn| {
            let next_seq: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(seq), -1) + 1 FROM cf_agents_events WHERE session_id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            conn.execute(
                "INSERT INTO cf_agents_events (session_id, seq, action, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, next_seq, action, metadata_text, created_at],
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(next_seq)
        })
        .await
    }

    /// Loads a window of events for a session, oldest-first, used to build
    /// a [`crate::session::WorkingContext`].
    pub async fn load_events(
        &self,
        session_id: &str,
        since_seq: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let session_id = session_id.to_string();
        let since_seq = since_seq.unwrap_or(-1);
        let limit = limit.unwrap_or(1000).min(10_000) as i64;
        self.sql(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT session_id, seq, action, metadata, created_at FROM cf_agents_events
                     WHERE session_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3",
                )
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(params![session_id, since_seq, limit], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let mut out = Vec::new();
            for row in rows {
                let (session_id, seq, action, metadata_text, created_at) =
                    row.map_err(|e| StoreError::Storage(e.to_string()))?;
                let metadata = serde_json::from_str(&metadata_text)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                out.push(StoredEvent {
                    session_id,
                    seq,
                    action,
                    metadata,
                    created_at,
                });
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn seq_is_per_session_monotonic() {
        let store = AgentStore::open_in_memory().unwrap();
        store.ensure_session("s1", 0).await.unwrap();
        let a = store
            .append_event("s1", "user_message", serde_json::json!({}), 1)
            .await
            .unwrap();
        let b = store
            .append_event("s1", "agent_message", serde_json::json!({}), 2)
            .await
            .unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn load_since_seq_excludes_seen() {
        let store = AgentStore::open_in_memory().unwrap();
        store.ensure_session("s1", 0).await.unwrap();
        store
            .append_event("s1", "user_message", serde_json::json!({}), 1)
            .await
            .unwrap();
        store
            .append_event("s1", "agent_message", serde_json::json!({}), 2)
            .await
            .unwrap();
        let events = store.load_events("s1", Some(0), None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "agent_message");
    }
}
