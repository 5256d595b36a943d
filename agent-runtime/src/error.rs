//! Flat, per-failure-mode error enums, one per subsystem, composed into
//! [`AgentError`] at the actor boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage: {0}")]
    Storage(String),
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("unknown callback method: {0}")]
    UnknownMethod(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("turn queue closed")]
    QueueClosed,
    #[error("no matching tool call in state input-available: {0}")]
    NoMatchingToolCall(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("illegal task transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("ephemeral task cannot waitForEvent")]
    EphemeralCannotWait,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("no pipeline in flight for connection {0}")]
    NoPipelineInFlight(String),
    #[error("collaborator failed: {0}")]
    Collaborator(String),
}

/// Top-level error surfaced at the actor/connection boundary, matching the
/// taxonomy an RPC error reply or protocol close code must distinguish.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("downstream: {0}")]
    Downstream(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<StoreError> for AgentError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(m) => AgentError::NotFound(m),
            other => AgentError::Internal(other.to_string()),
        }
    }
}

impl From<SchedulerError> for AgentError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::InvalidCron(m) => AgentError::InvalidRequest(m),
            SchedulerError::UnknownMethod(m) => AgentError::InvalidRequest(m),
            SchedulerError::Store(s) => s.into(),
        }
    }
}

impl From<ChatError> for AgentError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::QueueClosed => AgentError::Internal("turn queue closed".into()),
            ChatError::NoMatchingToolCall(m) => AgentError::Conflict(m),
            ChatError::Store(s) => s.into(),
        }
    }
}

impl From<TaskError> for AgentError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::IllegalTransition { from, to } => {
                AgentError::Conflict(format!("{from} -> {to}"))
            }
            TaskError::NotFound(m) => AgentError::NotFound(m),
            TaskError::EphemeralCannotWait => {
                AgentError::InvalidRequest("ephemeral task cannot waitForEvent".into())
            }
            TaskError::Store(s) => s.into(),
        }
    }
}

impl From<VoiceError> for AgentError {
    fn from(e: VoiceError) -> Self {
        AgentError::Downstream(e.to_string())
    }
}
