//! Error taxonomy for the bridge.
//!
//! Three caller-visible classes: validation failures (rejected before any
//! runtime call), runtime failures (the engine said no; callers see a sentinel
//! value, the full detail goes to the log), and protocol failures (the engine
//! spoke something we could not parse). Plain I/O errors are wrapped so `?`
//! works across the socket plumbing.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Caller-supplied input failed the allow-list checks. Never reaches the
    /// container runtime.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// The container engine reported a failure (not found, conflict,
    /// unreachable). Carries the engine's status and message for the log.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The engine's response could not be parsed.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BridgeError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        BridgeError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        BridgeError::Runtime(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        BridgeError::Protocol(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, BridgeError::Validation { .. })
    }
}
