//! Session / Event store (§4.7): a lower-level alternative to the chat
//! log — typed, discriminated events in append order, with a per-session
//! monotonic `seq`, and a pure-functional projection over a loaded window.

use crate::error::StoreError;
use crate::store::{AgentStore, StoredEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    UserMessage,
    AgentMessage,
    ToolCallRequest,
    ToolResult,
    SystemInstruction,
    Compaction,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::UserMessage => "user_message",
            EventKind::AgentMessage => "agent_message",
            EventKind::ToolCallRequest => "tool_call_request",
            EventKind::ToolResult => "tool_result",
            EventKind::SystemInstruction => "system_instruction",
            EventKind::Compaction => "compaction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "user_message" => EventKind::UserMessage,
            "agent_message" => EventKind::AgentMessage,
            "tool_call_request" => EventKind::ToolCallRequest,
            "tool_result" => EventKind::ToolResult,
            "system_instruction" => EventKind::SystemInstruction,
            "compaction" => EventKind::Compaction,
            _ => return None,
        })
    }
}

/// Thin typed wrapper over the raw `(session_id, action, metadata)` store
/// calls, so callers append by [`EventKind`] rather than a bare string tag.
#[derive(Clone)]
pub struct SessionLog {
    store: AgentStore,
}

impl SessionLog {
    pub fn new(store: AgentStore) -> Self {
        Self { store }
    }

    pub async fn ensure(&self, session_id: &str, now: i64) -> Result<(), StoreError> {
        self.store.ensure_session(session_id, now).await
    }

    pub async fn append(
        &self,
        session_id: &str,
        kind: EventKind,
        metadata: serde_json::Value,
        now: i64,
    ) -> Result<i64, StoreError> {
        self.store.append_event(session_id, kind.as_str(), metadata, now).await
    }

    /// Appends every event a turn produced, in order. Every write already
    /// funnels through the actor's single-writer context, so this is not
    /// required for correctness, but it keeps one turn's events contiguous
    /// in `seq` order rather than interleaved with a concurrent turn's
    /// partial writes (§4.7's "atomically at turn end").
    pub async fn append_turn(
        &self,
        session_id: &str,
        events: Vec<(EventKind, serde_json::Value)>,
        now: i64,
    ) -> Result<(), StoreError> {
        for (kind, metadata) in events {
            self.store.append_event(session_id, kind.as_str(), metadata, now).await?;
        }
        Ok(())
    }

    pub async fn load_window(
        &self,
        session_id: &str,
        since_seq: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        self.store.load_events(session_id, since_seq, limit).await
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WorkingMessage {
    pub role: String,
    pub content: serde_json::Value,
}

/// Instructions plus messages, built pure-functionally from a loaded event
/// window — no IO happens here, only in [`SessionLog::load_window`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkingContext {
    pub instructions: Vec<String>,
    pub messages: Vec<WorkingMessage>,
}

impl WorkingContext {
    pub fn build(events: &[StoredEvent], base_instructions: &[String]) -> Self {
        let mut ctx = WorkingContext {
            instructions: base_instructions.to_vec(),
            messages: Vec::new(),
        };
        for event in events {
            match EventKind::parse(&event.action) {
                Some(EventKind::UserMessage) => ctx.messages.push(WorkingMessage {
                    role: "user".into(),
                    content: event.metadata.clone(),
                }),
                Some(EventKind::AgentMessage) | Some(EventKind::ToolCallRequest) => {
                    ctx.messages.push(WorkingMessage {
                        role: "assistant".into(),
                        content: event.metadata.clone(),
                    })
                }
                Some(EventKind::ToolResult) => ctx.messages.push(WorkingMessage {
                    role: "tool".into(),
                    content: event.metadata.clone(),
                }),
                Some(EventKind::SystemInstruction) => {
                    if let Some(text) = event.metadata.get("text").and_then(|v| v.as_str()) {
                        ctx.instructions.push(text.to_string());
                    }
                }
                // A compaction event replaces everything before it with a
                // summary, so the messages that led up to it stop being
                // part of the working context.
                Some(EventKind::Compaction) => {
                    ctx.messages.clear();
                    if let Some(summary) = event.metadata.get("summary").and_then(|v| v.as_str()) {
                        ctx.instructions.push(summary.to_string());
                    }
                }
                None => {}
            }
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: i64, action: &str, metadata: serde_json::Value) -> StoredEvent {
        StoredEvent {
            session_id: "s1".into(),
            seq,
            action: action.into(),
            metadata,
            created_at: 0,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn append_then_load_round_trips() {
        let store = AgentStore::open_in_memory().unwrap();
        let log = SessionLog::new(store);
        log.ensure("s1", 0).await.unwrap();
        log.append("s1", EventKind::UserMessage, serde_json::json!({"text": "hi"}), 1)
            .await
            .unwrap();
        let events = log.load_window("s1", None, None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "user_message");
    }

    #[test]
    fn projection_orders_messages_by_role() {
        let events = vec![
            event(0, "user_message", serde_json::json!({"text": "hi"})),
            event(1, "agent_message", serde_json::json!({"text": "hello"})),
            event(2, "tool_result", serde_json::json!({"ok": true})),
        ];
        let ctx = WorkingContext::build(&events, &["be concise".into()]);
        assert_eq!(ctx.instructions, vec!["be concise".to_string()]);
        assert_eq!(ctx.messages.len(), 3);
        assert_eq!(ctx.messages[0].role, "user");
        assert_eq!(ctx.messages[1].role, "assistant");
        assert_eq!(ctx.messages[2].role, "tool");
    }

    #[test]
    fn compaction_clears_prior_messages_and_becomes_an_instruction() {
        let events = vec![
            event(0, "user_message", serde_json::json!({"text": "hi"})),
            event(1, "compaction", serde_json::json!({"summary": "user said hi"})),
            event(2, "user_message", serde_json::json!({"text": "and then?"})),
        ];
        let ctx = WorkingContext::build(&events, &[]);
        assert_eq!(ctx.instructions, vec!["user said hi".to_string()]);
        assert_eq!(ctx.messages.len(), 1);
    }
}
