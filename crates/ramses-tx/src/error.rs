//! Error types for RAMSES-II transport operations
//!
//! Packet-level errors ([`FramingError`], [`CodecError`]) are absorbed by the
//! processing pipeline: the offending line or message is dropped and reported.
//! Command errors are surfaced to the caller that issued the command. Only
//! transport I/O failures are fatal to the processing loop.

use thiserror::Error;

use crate::packet::{Code, Verb};

/// A raw line could not be framed into a packet
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// The line ended before a mandatory field
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// Timestamp token is not a valid ISO datetime
    #[error("invalid timestamp: {0}")]
    TimestampMalformed(String),

    /// Verb token is not one of I, W, RQ, RP
    #[error("invalid verb: {0}")]
    VerbMalformed(String),

    /// Sequence token is neither `---` nor three digits
    #[error("invalid sequence number: {0}")]
    SequenceMalformed(String),

    /// Address token is not `NN:NNNNNN` or `--:------`
    #[error("invalid address: {0}")]
    AddressMalformed(String),

    /// The combination of address slots is not a valid layout
    #[error("invalid address set: {0}")]
    AddressSetInvalid(String),

    /// Code token is not four hex digits
    #[error("invalid code: {0} (expecting 4 hex digits)")]
    CodeMalformed(String),

    /// Length token is not three decimal digits
    #[error("invalid length field: {0}")]
    LengthMalformed(String),

    /// Payload has an odd number of hex digits
    #[error("odd-length payload: {0} hex digits")]
    OddLengthPayload(usize),

    /// Payload contains non-hex characters
    #[error("payload is not hex: {0}")]
    PayloadNotHex(String),

    /// Declared length differs from the payload size
    #[error("declared length {declared} does not match payload length {actual}")]
    LengthMismatch {
        /// Length field value
        declared: usize,
        /// Actual payload size in bytes
        actual: usize,
    },

    /// Payload exceeds the protocol maximum
    #[error("payload too long: {0} bytes")]
    PayloadTooLong(usize),
}

impl FramingError {
    /// Name of the field that failed validation
    pub fn field(&self) -> &'static str {
        match self {
            FramingError::MissingField(field) => field,
            FramingError::TimestampMalformed(_) => "timestamp",
            FramingError::VerbMalformed(_) => "verb",
            FramingError::SequenceMalformed(_) => "sequence",
            FramingError::AddressMalformed(_) | FramingError::AddressSetInvalid(_) => "address",
            FramingError::CodeMalformed(_) => "code",
            FramingError::LengthMalformed(_) | FramingError::LengthMismatch { .. } => "length",
            FramingError::OddLengthPayload(_)
            | FramingError::PayloadNotHex(_)
            | FramingError::PayloadTooLong(_) => "payload",
        }
    }
}

/// A payload could not be decoded, encoded or assembled
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Payload length is not valid for this code/verb
    #[error("{code}: invalid payload length {len}")]
    InvalidLength {
        /// Command code
        code: Code,
        /// Payload length in bytes
        len: usize,
    },

    /// Payload content is not valid for this code
    #[error("{code}: invalid payload: {reason}")]
    InvalidPayload {
        /// Command code
        code: Code,
        /// What was wrong
        reason: String,
    },

    /// The logical payload does not fit this code/verb
    #[error("{code}: cannot encode {verb}: {reason}")]
    InvalidRequest {
        /// Command code
        code: Code,
        /// Verb being encoded
        verb: Verb,
        /// What was wrong
        reason: String,
    },

    /// No codec is registered for the code
    #[error("no codec registered for code {0}")]
    UnknownCode(Code),

    /// Fragments could not be merged into a complete payload
    #[error("{code}: cannot assemble fragments: {reason}")]
    Assembly {
        /// Command code
        code: Code,
        /// What was wrong
        reason: String,
    },
}

impl CodecError {
    pub(crate) fn invalid(code: Code, reason: impl Into<String>) -> Self {
        CodecError::InvalidPayload {
            code,
            reason: reason.into(),
        }
    }

    pub(crate) fn length(code: Code, len: usize) -> Self {
        CodecError::InvalidLength { code, len }
    }

    pub(crate) fn request(code: Code, verb: Verb, reason: impl Into<String>) -> Self {
        CodecError::InvalidRequest {
            code,
            verb,
            reason: reason.into(),
        }
    }
}

/// Main error type for RAMSES-II transport operations
#[derive(Error, Debug)]
pub enum RamsesError {
    // ===== Packet Errors =====
    /// Malformed line
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Payload decode/encode failure
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    // ===== Command Errors =====
    /// No correlated response within the deadline
    #[error("No response to {command} within {elapsed_ms}ms")]
    CorrelationTimeout {
        /// Command identity
        command: String,
        /// Time waited in milliseconds
        elapsed_ms: u64,
    },

    /// Terminal command failure
    #[error("Retries exhausted for {command} after {attempts} attempts: {reason}")]
    RetryExhausted {
        /// Command identity
        command: String,
        /// Number of transmissions made
        attempts: u8,
        /// Last failure reason
        reason: String,
    },

    /// Command was cancelled by its caller
    #[error("Command cancelled: {0}")]
    Cancelled(String),

    /// Command queue is full
    #[error("Command queue full ({0} pending)")]
    QueueFull(usize),

    // ===== Binding Errors =====
    /// Binding handshake abandoned
    #[error("Binding timed out while {phase} (supplicant {supplicant})")]
    BindingTimeout {
        /// Supplicant device
        supplicant: String,
        /// Phase that stalled
        phase: String,
    },

    // ===== Transport Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Serial port open failed
    #[error("Failed to open serial port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// Read error
    #[error("Read error: {0}")]
    ReadError(String),

    /// Write error
    #[error("Write error: {0}")]
    WriteError(String),

    /// Interface disconnected
    #[error("Interface disconnected")]
    Disconnected,

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelError(String),

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// JSON error wrapper
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RamsesError {
    /// Check if this error may succeed when retried
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RamsesError::CorrelationTimeout { .. }
                | RamsesError::Disconnected
                | RamsesError::ReadError(_)
                | RamsesError::WriteError(_)
        )
    }

    /// Check if this is a packet-level error (absorbed by the pipeline)
    pub fn is_packet_error(&self) -> bool {
        matches!(self, RamsesError::Framing(_) | RamsesError::Codec(_))
    }

    /// Check if this error must stop the processing loop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RamsesError::PortNotFound(_)
                | RamsesError::PortOpenFailed { .. }
                | RamsesError::ReadError(_)
                | RamsesError::WriteError(_)
                | RamsesError::Disconnected
                | RamsesError::Io(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            RamsesError::Framing(_) => "FRAMING_ERROR",
            RamsesError::Codec(_) => "CODEC_ERROR",
            RamsesError::CorrelationTimeout { .. } => "CORRELATION_TIMEOUT",
            RamsesError::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            RamsesError::Cancelled(_) => "CANCELLED",
            RamsesError::QueueFull(_) => "QUEUE_FULL",
            RamsesError::BindingTimeout { .. } => "BINDING_TIMEOUT",
            RamsesError::PortNotFound(_) => "PORT_NOT_FOUND",
            RamsesError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            RamsesError::ReadError(_) => "READ_ERROR",
            RamsesError::WriteError(_) => "WRITE_ERROR",
            RamsesError::Disconnected => "DISCONNECTED",
            RamsesError::InvalidConfig(_) => "INVALID_CONFIG",
            RamsesError::ChannelError(_) => "CHANNEL_ERROR",
            RamsesError::ChannelClosed => "CHANNEL_CLOSED",
            RamsesError::Json(_) => "JSON_ERROR",
            RamsesError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for RAMSES-II transport operations
pub type Result<T> = std::result::Result<T, RamsesError>;

impl From<hex::FromHexError> for FramingError {
    fn from(err: hex::FromHexError) -> Self {
        FramingError::PayloadNotHex(err.to_string())
    }
}

// Conversion from serial port errors (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<tokio_serial::Error> for RamsesError {
    fn from(err: tokio_serial::Error) -> Self {
        match err.kind {
            tokio_serial::ErrorKind::NoDevice => RamsesError::PortNotFound(err.description),
            tokio_serial::ErrorKind::Io(kind) => {
                RamsesError::Io(std::io::Error::new(kind, err.description))
            }
            _ => RamsesError::PortOpenFailed {
                port: String::new(),
                reason: err.description,
            },
        }
    }
}

// Conversion from tokio mpsc send error
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RamsesError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RamsesError::ChannelError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = RamsesError::PortNotFound("/dev/ttyUSB0".to_string());
        assert_eq!(err.error_code(), "PORT_NOT_FOUND");

        let err: RamsesError = FramingError::OddLengthPayload(3).into();
        assert_eq!(err.error_code(), "FRAMING_ERROR");
    }

    #[test]
    fn test_is_retriable() {
        assert!(RamsesError::Disconnected.is_retriable());
        assert!(RamsesError::CorrelationTimeout {
            command: "RQ 01:145038 0004".to_string(),
            elapsed_ms: 500
        }
        .is_retriable());
        assert!(!RamsesError::Cancelled("x".to_string()).is_retriable());
    }

    #[test]
    fn test_packet_errors_are_not_fatal() {
        let err: RamsesError = FramingError::LengthMismatch {
            declared: 24,
            actual: 20,
        }
        .into();
        assert!(err.is_packet_error());
        assert!(!err.is_fatal());

        let err: RamsesError = CodecError::UnknownCode(Code(0x7FFF)).into();
        assert!(err.is_packet_error());
        assert!(RamsesError::Disconnected.is_fatal());
    }

    #[test]
    fn test_framing_error_field() {
        assert_eq!(
            FramingError::LengthMismatch {
                declared: 24,
                actual: 20
            }
            .field(),
            "length"
        );
        assert_eq!(FramingError::CodeMalformed("22G9".into()).field(), "code");
        assert_eq!(FramingError::MissingField("payload").field(), "payload");
    }

    #[test]
    fn test_length_mismatch_message() {
        let err = FramingError::LengthMismatch {
            declared: 24,
            actual: 20,
        };
        assert!(err.to_string().contains("24"));
        assert!(err.to_string().contains("20"));
    }
}
