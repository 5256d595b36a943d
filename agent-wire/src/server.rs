//! Frames sent server -> client.

use serde::{Deserialize, Serialize};

use crate::chat::WireMessage;
use crate::mcp::McpInfo;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Sent exactly once, immediately after a connection is admitted, before
    /// any other frame. Carries the name/class this connection was routed to
    /// so a client that dialed by alias can confirm what it is attached to.
    Identity { class: String, name: String },

    /// Full state mirror. Sent once on connect (the initial sync) and again
    /// every time the agent's state changes thereafter — there is no
    /// separate "initial state" message type, connect-time and steady-state
    /// updates share this same tag.
    CfAgentState { state: serde_json::Value },

    /// Tool registry mirror, same connect-then-on-change cadence as
    /// `CfAgentState`.
    CfAgentMcp { mcp: McpInfo },

    /// Full chat history, sent in answer to `ClientFrame::CfAgentChatMessages`.
    CfAgentChatMessages { messages: Vec<WireMessage> },

    /// One incremental step of a streaming chat turn: a part appended or
    /// updated on the in-progress assistant message, or the turn's terminal
    /// state once `done` is true.
    CfAgentUseChatResponse {
        turn_id: String,
        message: WireMessage,
        done: bool,
    },

    /// Answer to a `ClientFrame::Rpc` call.
    Rpc {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Out-of-band failure not tied to any one request (e.g. a turn aborted
    /// by an internal error rather than cancellation).
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{MessagePart, Role};

    #[test]
    fn identity_roundtrip() {
        let frame = ServerFrame::Identity {
            class: "chatbot".into(),
            name: "room-42".into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"identity\""));
        let back: ServerFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn chat_response_roundtrip() {
        let frame = ServerFrame::CfAgentUseChatResponse {
            turn_id: "t1".into(),
            message: WireMessage {
                id: "m1".into(),
                role: Role::Assistant,
                parts: vec![MessagePart::Text {
                    text: "hi".into(),
                }],
                created_at: None,
            },
            done: false,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"cf_agent_use_chat_response\""));
        let back: ServerFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn rpc_error_omits_result() {
        let frame = ServerFrame::Rpc {
            id: "1".into(),
            result: None,
            error: Some("not found".into()),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("\"result\""));
    }
}
