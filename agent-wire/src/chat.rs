//! Chat message shapes shared by the `cf_agent_chat_messages` /
//! `cf_agent_use_chat_request` / `cf_agent_use_chat_response` frames.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// A single message in the durable chat log, as mirrored to clients.
///
/// `parts` rather than a flat `content: String` so that a message can carry
/// interleaved text and tool-call parts without losing ordering — the same
/// shape the log stores and the same shape a resumed stream finalizes into.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    pub id: String,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    /// An attached file, referenced by URL rather than inlined bytes — the
    /// wire protocol carries pointers, not payloads (§4.4 "Parts are typed").
    File {
        url: String,
        media_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// A model's reasoning/thinking trace, kept distinct from `Text` so a
    /// client can choose not to render it.
    Reasoning {
        text: String,
    },
    ToolCall {
        tool_call_id: String,
        name: String,
        args: serde_json::Value,
        #[serde(default)]
        state: ToolPartState,
    },
    ToolResult {
        tool_call_id: String,
        result: serde_json::Value,
    },
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolPartState {
    #[default]
    Pending,
    AwaitingConfirmation,
    Executing,
    Done,
    Denied,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_part_tags_by_type() {
        let part = MessagePart::Text {
            text: "hello".into(),
        };
        let json = serde_json::to_string(&part).unwrap();
        assert!(json.contains("\"type\":\"text\""));
        let back: MessagePart = serde_json::from_str(&json).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn tool_part_state_defaults_to_pending() {
        let json = r#"{"type":"tool_call","tool_call_id":"t1","name":"search","args":{}}"#;
        let part: MessagePart = serde_json::from_str(json).unwrap();
        match part {
            MessagePart::ToolCall { state, .. } => assert_eq!(state, ToolPartState::Pending),
            _ => panic!("expected tool_call"),
        }
    }

    #[test]
    fn file_part_roundtrips_without_a_name() {
        let part = MessagePart::File {
            url: "https://example.com/a.png".into(),
            media_type: "image/png".into(),
            name: None,
        };
        let json = serde_json::to_string(&part).unwrap();
        assert!(json.contains("\"type\":\"file\""));
        assert!(!json.contains("\"name\""));
        let back: MessagePart = serde_json::from_str(&json).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn reasoning_part_tags_by_type() {
        let part = MessagePart::Reasoning {
            text: "weighing options".into(),
        };
        let json = serde_json::to_string(&part).unwrap();
        assert!(json.contains("\"type\":\"reasoning\""));
        let back: MessagePart = serde_json::from_str(&json).unwrap();
        assert_eq!(back, part);
    }
}
