//! Conversions between the wire message shape and the store's row shape,
//! plus the tool-part lookup the HITL gate needs.

use agent_wire::{MessagePart, Role, ToolPartState, WireMessage};

use crate::error::ChatError;
use crate::store::{AgentStore, StoredMessage};

pub fn role_to_str(role: &Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
        Role::Tool => "tool",
    }
}

pub fn str_to_role(s: &str) -> Role {
    match s {
        "assistant" => Role::Assistant,
        "system" => Role::System,
        "tool" => Role::Tool,
        _ => Role::User,
    }
}

pub fn to_stored_parts(message: &WireMessage) -> serde_json::Value {
    serde_json::to_value(&message.parts).unwrap_or(serde_json::Value::Array(vec![]))
}

pub fn from_stored(row: &StoredMessage) -> Result<WireMessage, ChatError> {
    let parts: Vec<MessagePart> = serde_json::from_value(row.parts.clone())
        .map_err(|e| crate::error::StoreError::Serialization(e.to_string()))?;
    Ok(WireMessage {
        id: row.id.clone(),
        role: str_to_role(&row.role),
        parts,
        created_at: Some(row.created_at.to_string()),
    })
}

/// Finds the tool-call part with `tool_call_id` inside `message`, if it is
/// currently awaiting confirmation — the only state a
/// `cf_agent_tool_result` frame may legally resolve (§4.4's HITL gate).
pub fn find_awaiting_tool_call<'a>(
    message: &'a WireMessage,
    tool_call_id: &str,
) -> Option<&'a MessagePart> {
    message.parts.iter().find(|part| match part {
        MessagePart::ToolCall {
            tool_call_id: id,
            state,
            ..
        } => id == tool_call_id && *state == ToolPartState::AwaitingConfirmation,
        _ => false,
    })
}

/// Replaces the matching tool-call part's state and folds the result in as
/// a following `ToolResult` part, without disturbing any other part or the
/// assistant message's id — tool-call ids must remain attached to the
/// message they were produced on (§9, the bug the source must not
/// reproduce).
pub fn resolve_tool_call(
    message: &mut WireMessage,
    tool_call_id: &str,
    result: serde_json::Value,
) -> Result<(), ChatError> {
    let found = message.parts.iter_mut().find_map(|part| match part {
        MessagePart::ToolCall {
            tool_call_id: id,
            state,
            ..
        } if id == tool_call_id && *state == ToolPartState::AwaitingConfirmation => {
            *state = ToolPartState::Done;
            Some(())
        }
        _ => None,
    });
    if found.is_none() {
        return Err(ChatError::NoMatchingToolCall(tool_call_id.to_string()));
    }
    message.parts.push(MessagePart::ToolResult {
        tool_call_id: tool_call_id.to_string(),
        result,
    });
    Ok(())
}

impl AgentStore {
    pub async fn append_wire_message_if_absent(
        &self,
        message: &WireMessage,
        created_at: i64,
    ) -> Result<bool, crate::error::StoreError> {
        self.append_message_if_absent(
            &message.id,
            role_to_str(&message.role),
            to_stored_parts(message),
            created_at,
        )
        .await
    }

    pub async fn replace_wire_message(
        &self,
        message: &WireMessage,
    ) -> Result<(), crate::error::StoreError> {
        self.replace_message_parts(&message.id, to_stored_parts(message))
            .await
    }

    pub async fn list_wire_messages(
        &self,
        limit: Option<u32>,
    ) -> Result<Vec<WireMessage>, ChatError> {
        let rows = self.list_messages(limit).await?;
        rows.iter().map(from_stored).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_wire::MessagePart;

    fn tool_call_message(state: ToolPartState) -> WireMessage {
        WireMessage {
            id: "m1".into(),
            role: Role::Assistant,
            parts: vec![MessagePart::ToolCall {
                tool_call_id: "c1".into(),
                name: "delete".into(),
                args: serde_json::json!({"name": "foo"}),
                state,
            }],
            created_at: None,
        }
    }

    #[test]
    fn finds_only_awaiting_confirmation() {
        let msg = tool_call_message(ToolPartState::AwaitingConfirmation);
        assert!(find_awaiting_tool_call(&msg, "c1").is_some());
        let msg = tool_call_message(ToolPartState::Done);
        assert!(find_awaiting_tool_call(&msg, "c1").is_none());
    }

    #[test]
    fn resolve_keeps_tool_call_id_attached() {
        let mut msg = tool_call_message(ToolPartState::AwaitingConfirmation);
        resolve_tool_call(&mut msg, "c1", serde_json::json!({"ok": true})).unwrap();
        assert_eq!(msg.parts.len(), 2);
        match &msg.parts[0] {
            MessagePart::ToolCall { tool_call_id, state, .. } => {
                assert_eq!(tool_call_id, "c1");
                assert_eq!(*state, ToolPartState::Done);
            }
            _ => panic!("expected tool call to remain"),
        }
    }

    #[test]
    fn resolve_without_match_is_an_error() {
        let mut msg = tool_call_message(ToolPartState::Done);
        let err = resolve_tool_call(&mut msg, "c1", serde_json::json!({}));
        assert!(err.is_err());
    }
}
