//! Frames sent client -> server.

use serde::{Deserialize, Serialize};

use crate::chat::WireMessage;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Push a full or partial state patch up to the agent. The agent applies
    /// it the same way a local `setState` call would and then mirrors the
    /// result back down to every connection, including this one.
    CfAgentState { state: serde_json::Value },

    /// Ask for the full chat history to be sent back as a
    /// `ServerFrame::CfAgentChatMessages`.
    CfAgentChatMessages,

    /// Truncate the chat log to empty.
    CfAgentChatClear,

    /// Cancel the turn currently streaming on this connection, if any.
    CfAgentChatRequestCancel { turn_id: String },

    /// Start a new chat turn.
    CfAgentUseChatRequest {
        turn_id: String,
        messages: Vec<WireMessage>,
        /// Everything besides `messages`/`clientTools` in the request
        /// body; stored and reused by a later auto-continue (§4.4 step 2).
        #[serde(default)]
        custom_body: Option<serde_json::Value>,
        /// Client-side tool declarations the handler may call out to. Not
        /// interpreted by the wire layer itself, carried through to the
        /// handler as part of `custom_body`'s sibling data.
        #[serde(default)]
        client_tools: Option<serde_json::Value>,
    },

    /// Deliver the result of a tool call the server asked this client to run
    /// (human-in-the-loop confirmation or a client-side tool).
    CfAgentToolResult {
        turn_id: String,
        tool_call_id: String,
        tool_name: String,
        result: serde_json::Value,
        /// When true, the engine enqueues a continuation turn reusing the
        /// stored chat body as soon as this result is applied (§4.4, §8.3).
        #[serde(default)]
        auto_continue: bool,
    },

    /// Generic request/response call into the agent's exposed method table.
    Rpc {
        id: String,
        method: String,
        #[serde(default)]
        args: serde_json::Value,
    },
}

impl ClientFrame {
    /// Parse a raw text frame off the wire. A frame whose `type` tag is
    /// unrecognized deserializes as `Err` here rather than panicking the
    /// connection task; callers decide whether an unknown frame type is
    /// worth logging and dropping or worth closing the connection over.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
