//! Gateway interfaces
//!
//! A RAMSES-II gateway (evofw3 or HGI80) is a line-oriented device: every
//! packet it hears is reported as one text line, and frames written to it
//! (terminated by `\r\n`) are transmitted.
//!
//! - [`SerialInterface`] - USB/serial gateway (requires `serial` feature)
//! - [`crate::test_utils::MockInterface`] - in-memory interface for tests
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```

mod lines;

#[cfg(feature = "serial")]
mod serial;

pub use lines::LineBuffer;

#[cfg(feature = "serial")]
pub use serial::SerialInterface;

use crate::error::Result;
use async_trait::async_trait;

/// Trait for gateway interfaces
///
/// `read_line` must be cancel-safe: it is polled inside `select!` alongside
/// command and timer branches.
#[async_trait]
pub trait RamsesInterface: Send {
    /// Open the connection to the gateway
    async fn connect(&mut self) -> Result<()>;

    /// Close the connection
    async fn disconnect(&mut self) -> Result<()>;

    /// Check if currently connected
    fn is_connected(&self) -> bool;

    /// Read the next line reported by the gateway
    ///
    /// Returns `None` if no complete line is available yet.
    /// Returns `Err` on connection/read errors.
    async fn read_line(&mut self) -> Result<Option<String>>;

    /// Write a frame for transmission (without line terminator)
    async fn write_frame(&mut self, frame: &str) -> Result<()>;

    /// Get the interface name (for logging)
    fn name(&self) -> &str;
}

/// Connection state for interfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Successfully connected
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    }
}
