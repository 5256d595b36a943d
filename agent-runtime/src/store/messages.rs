//! The `cf_agents_messages` table: append-ordered chat log.
//!
//! Rows are addressed by an opaque `id` rather than an autoincrement
//! integer because a streaming assistant message is identified by id and
//! rewritten in place as chunks arrive (§4.4) — the monotonic `seq` column
//! carries the insertion order invariant instead.

use rusqlite::params;

use crate::error::StoreError;
use crate::store::AgentStore;

#[derive(Clone, Debug, PartialEq)]
pub struct StoredMessage {
    pub id: String,
    pub role: String,
    pub parts: serde_json::Value,
    pub created_at: i64,
    pub seq: i64,
}

impl AgentStore {
    /// Inserts a message if `id` is not already present; a no-op otherwise
    /// (the dedup-by-id rule in §4.4 step 1).
    pub async fn append_message_if_absent(
        &self,
        id: &str,
        role: &str,
        parts: serde_json::Value,
        created_at: i64,
    ) -> Result<bool, StoreError> {
        let id = id.to_string();
        let role = role.to_string();
        let parts_text =
            serde_json::to_string(&parts).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.sql(move |conn| {
            let next_seq: i64 = conn
                .query_row("SELECT COALESCE(MAX(seq), -1) + 1 FROM cf_agents_messages", [], |r| {
                    r.get(0)
                })
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let changed = conn
                .execute(
                    "INSERT OR IGNORE INTO cf_agents_messages (id, role, parts, created_at, seq)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, role, parts_text, created_at, next_seq],
                )
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(changed > 0)
        })
        .await
    }

    /// Rewrites the `parts` of an existing message row by id — the
    /// mechanism a streaming assistant message uses to accumulate chunks
    /// without violating message-log monotonicity (the row's position in
    /// `seq` order never changes, only its content).
    pub async fn replace_message_parts(
        &self,
        id: &str,
        parts: serde_json::Value,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        let parts_text =
            serde_json::to_string(&parts).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.sql(move |conn| {
            conn.execute(
                "UPDATE cf_agents_messages SET parts = ?1 WHERE id = ?2",
                params![parts_text, id],
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
    }

    /// Lists messages in log order. `limit` caps the tail returned,
    /// ordered oldest-first to match how the chat log is consumed.
    pub async fn list_messages(&self, limit: Option<u32>) -> Result<Vec<StoredMessage>, StoreError> {
        let limit = limit.unwrap_or(1000).min(10_000) as i64;
        self.sql(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, role, parts, created_at, seq FROM cf_agents_messages
                     ORDER BY seq ASC LIMIT ?1",
                )
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    let parts_text: String = row.get(2)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        parts_text,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let mut out = Vec::new();
            for row in rows {
                let (id, role, parts_text, created_at, seq) =
                    row.map_err(|e| StoreError::Storage(e.to_string()))?;
                let parts = serde_json::from_str(&parts_text)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                out.push(StoredMessage {
                    id,
                    role,
                    parts,
                    created_at,
                    seq,
                });
            }
            Ok(out)
        })
        .await
    }

    /// Deletes every message row — the durable half of `cf_agent_chat_clear`.
    pub async fn clear_messages(&self) -> Result<(), StoreError> {
        self.sql(|conn| {
            conn.execute("DELETE FROM cf_agents_messages", [])
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
    }
}
