use serde_json::Value;
use thiserror::Error;

use crate::protocol::ContextId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerError {
    #[error("Failed to serialize message: {0}")]
    SerializeError(String),

    #[error("Failed to deserialize message: {0}")]
    DeserializeError(String),

    #[error("JSON error: {0}")]
    JsonError(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Failed to spawn worker {path}: {reason}")]
    SpawnError { path: String, reason: String },

    #[error("Remote call error: {0}")]
    Remote(Value),

    #[error("{0}")]
    Rejected(String),

    #[error(".create called after .destroy")]
    UsedAfterDestroy,

    #[error("Worker has been destroyed")]
    Destroyed,

    #[error("Context not found: {0}")]
    UnknownContext(ContextId),

    #[error("Method not found: {0}")]
    UnknownMethod(String),

    #[error("Unknown activity: {0}")]
    UnknownActivity(String),

    #[error("Method already registered: {0}")]
    DuplicateMethod(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Context {0} destroyed before the delegated call settled")]
    ContextDestroyed(ContextId),

    #[error("Timeout waiting for response")]
    Timeout,
}

impl WorkerError {
    /// Application error carrying an arbitrary payload back to the caller.
    pub fn remote(payload: impl Into<Value>) -> Self {
        WorkerError::Remote(payload.into())
    }

    /// Payload placed in the `error` field of a reply.
    pub fn to_payload(&self) -> Value {
        match self {
            WorkerError::Remote(payload) => payload.clone(),
            other => Value::String(other.to_string()),
        }
    }

    pub fn from_payload(payload: Value) -> Self {
        WorkerError::Remote(payload)
    }

    /// Short variant name used as `error_type` in log entries.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::SerializeError(_) => "SerializeError",
            WorkerError::DeserializeError(_) => "DeserializeError",
            WorkerError::JsonError(_) => "JsonError",
            WorkerError::ChannelClosed => "ChannelClosed",
            WorkerError::SpawnError { .. } => "SpawnError",
            WorkerError::Remote(_) => "Remote",
            WorkerError::Rejected(_) => "Rejected",
            WorkerError::UsedAfterDestroy => "UsedAfterDestroy",
            WorkerError::Destroyed => "Destroyed",
            WorkerError::UnknownContext(_) => "UnknownContext",
            WorkerError::UnknownMethod(_) => "UnknownMethod",
            WorkerError::UnknownActivity(_) => "UnknownActivity",
            WorkerError::DuplicateMethod(_) => "DuplicateMethod",
            WorkerError::InvalidMessage(_) => "InvalidMessage",
            WorkerError::ContextDestroyed(_) => "ContextDestroyed",
            WorkerError::Timeout => "Timeout",
        }
    }
}

impl From<rmp_serde::encode::Error> for WorkerError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        WorkerError::SerializeError(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for WorkerError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        WorkerError::DeserializeError(err.to_string())
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        WorkerError::JsonError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
