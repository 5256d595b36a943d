//! Runtime for long-lived, addressable, single-writer stateful agents.
//!
//! One Tokio task per live agent instance owns its mailbox and its embedded
//! SQL store; everything else in this crate — scheduling, chat, tasks,
//! voice, sessions — is built on top of that single-writer guarantee rather
//! than its own locking.

pub mod actor;
pub mod chat;
pub mod error;
pub mod llm;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod tasks;
pub mod voice;

pub use error::{AgentError, ChatError, SchedulerError, StoreError, TaskError, VoiceError};
