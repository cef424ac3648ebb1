//! Error types for the RAMSES-II gateway service

use ramses_tx::RamsesError;
use thiserror::Error;

/// Errors raised by the gateway and its entity graph
#[derive(Error, Debug)]
pub enum RfError {
    // ===== Transport Errors =====
    /// Error from the packet transport (including binding timeouts)
    #[error(transparent)]
    Transport(#[from] RamsesError),

    // ===== Exchange Errors =====
    /// A reply did not carry the expected payload
    #[error("Unexpected reply to {command}: {reason}")]
    UnexpectedReply {
        /// Command that was sent
        command: String,
        /// What was wrong with the reply
        reason: String,
    },

    /// Schedule could not be read or written
    #[error("Schedule error for zone {zone_idx:02X}: {reason}")]
    Schedule {
        /// Zone index (00 for DHW)
        zone_idx: u8,
        /// Reason for the failure
        reason: String,
    },

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== Service Errors =====
    /// The gateway task is no longer running
    #[error("Gateway stopped")]
    GatewayStopped,

    // ===== General Errors =====
    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RfError {
    /// Check if this error may succeed when retried
    pub fn is_retriable(&self) -> bool {
        match self {
            RfError::Transport(RamsesError::BindingTimeout { .. }) => true,
            RfError::Transport(e) => e.is_retriable(),
            _ => false,
        }
    }

    /// Check if this error ends the gateway
    pub fn is_fatal(&self) -> bool {
        match self {
            RfError::Transport(e) => e.is_fatal(),
            RfError::GatewayStopped => true,
            _ => false,
        }
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            RfError::Transport(e) => e.error_code(),
            RfError::UnexpectedReply { .. } => "UNEXPECTED_REPLY",
            RfError::Schedule { .. } => "SCHEDULE_ERROR",
            RfError::InvalidConfig(_) => "INVALID_CONFIG",
            RfError::GatewayStopped => "GATEWAY_STOPPED",
            RfError::Json(_) => "JSON_ERROR",
            RfError::Io(_) => "IO_ERROR",
        }
    }

    pub(crate) fn unexpected(command: impl ToString, reason: impl Into<String>) -> Self {
        RfError::UnexpectedReply {
            command: command.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, RfError>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RfError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RfError::GatewayStopped
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for RfError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        RfError::GatewayStopped
    }
}
