//! Wire protocol for the agent runtime's duplex connection.
//!
//! This crate defines only the JSON shape exchanged over the wire; it has no
//! knowledge of actors, stores, or schedulers. `agent-runtime` and
//! `agent-server` both depend on it so that the frame types used inside the
//! actor loop and the ones serialized to the socket are the same types.
//!
//! Every frame carries `type` as its first JSON field (`#[serde(tag =
//! "type")]`), matching every message name enumerated by the protocol:
//! `cf_agent_state`, `cf_agent_mcp`, `cf_agent_chat_messages`,
//! `cf_agent_chat_clear`, `cf_agent_chat_request_cancel`,
//! `cf_agent_use_chat_request`, `cf_agent_use_chat_response`,
//! `cf_agent_tool_result`, `rpc`. A received frame that does not parse as a
//! known `type` is not an error at this layer — see [`ClientFrame::parse`].

pub mod chat;
pub mod client;
pub mod mcp;
pub mod server;

pub use chat::{MessagePart, Role, ToolPartState, WireMessage};
pub use client::ClientFrame;
pub use mcp::{McpInfo, PromptInfo, ResourceInfo, ServerInfo, ToolInfo};
pub use server::ServerFrame;
