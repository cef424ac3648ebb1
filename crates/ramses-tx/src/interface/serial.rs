//! Serial port interface for RAMSES-II gateways
//!
//! Talks to an evofw3 or HGI80 gateway over a USB serial port using
//! tokio-serial. Received bytes are split into lines; frames are written
//! with a `\r\n` terminator.

use crate::config::{InterfaceConfig, DEFAULT_BAUD_RATE};
use crate::error::{RamsesError, Result};
use crate::interface::{ConnectionState, LineBuffer, RamsesInterface};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace};

/// Buffer size for reading from serial port
const READ_BUFFER_SIZE: usize = 256;

/// Default port timeout
const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Serial interface to a RAMSES-II gateway
pub struct SerialInterface {
    /// Serial port path
    port_path: PathBuf,

    /// Baud rate
    baud_rate: u32,

    /// Port timeout
    timeout: Duration,

    /// Serial stream (when connected)
    stream: Option<SerialStream>,

    /// Current connection state
    state: ConnectionState,

    /// Bytes of the line being received
    lines: LineBuffer,

    /// Interface name for logging
    name: String,
}

impl SerialInterface {
    /// Create a new serial interface
    pub fn new(port: impl AsRef<Path>) -> Self {
        let port_path = port.as_ref().to_path_buf();
        let name = format!("serial:{}", port_path.display());

        Self {
            port_path,
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            stream: None,
            state: ConnectionState::Disconnected,
            lines: LineBuffer::new(),
            name,
        }
    }

    /// Create from interface settings
    pub fn from_config(config: &InterfaceConfig) -> Self {
        match config {
            InterfaceConfig::Serial { port, baud_rate } => Self::new(port).with_baud_rate(*baud_rate),
        }
    }

    /// Create with custom baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Create with custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the port path
    pub fn port_path(&self) -> &Path {
        &self.port_path
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

#[async_trait]
impl RamsesInterface for SerialInterface {
    async fn connect(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        info!(port = %self.port_path.display(), baud = self.baud_rate, "Connecting to serial port");

        if !self.port_path.exists() {
            self.state = ConnectionState::Disconnected;
            return Err(RamsesError::PortNotFound(
                self.port_path.display().to_string(),
            ));
        }

        let stream = tokio_serial::new(self.port_path.to_string_lossy(), self.baud_rate)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(|e| {
                self.state = ConnectionState::Disconnected;
                RamsesError::PortOpenFailed {
                    port: self.port_path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;

        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
        self.lines.clear();

        info!(port = %self.port_path.display(), "Connected to gateway");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stream.take();
        self.state = ConnectionState::Disconnected;
        self.lines.clear();

        info!(port = %self.port_path.display(), "Disconnected from serial port");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.stream.is_some()
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        if let Some(line) = self.lines.next_line() {
            return Ok(Some(line));
        }

        let stream = self.stream.as_mut().ok_or(RamsesError::Disconnected)?;
        let mut buf = [0u8; READ_BUFFER_SIZE];

        match stream.read(&mut buf).await {
            Ok(0) => {
                self.state = ConnectionState::Disconnected;
                Err(RamsesError::Disconnected)
            }
            Ok(n) => {
                trace!(bytes = n, "Read from serial port");
                self.lines.extend(&buf[..n]);
                Ok(self.lines.next_line())
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => {
                error!(error = %e, "Serial read error");
                self.state = ConnectionState::Disconnected;
                Err(RamsesError::ReadError(e.to_string()))
            }
        }
    }

    async fn write_frame(&mut self, frame: &str) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(RamsesError::Disconnected)?;
        debug!(frame = %frame, "Writing frame");

        let line = format!("{frame}\r\n");
        stream.write_all(line.as_bytes()).await.map_err(|e| {
            error!(error = %e, "Serial write error");
            self.state = ConnectionState::Disconnected;
            RamsesError::WriteError(e.to_string())
        })?;

        stream
            .flush()
            .await
            .map_err(|e| RamsesError::WriteError(format!("Flush failed: {}", e)))?;

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SerialInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialInterface")
            .field("port", &self.port_path)
            .field("baud_rate", &self.baud_rate)
            .field("state", &self.state)
            .field("pending", &self.lines.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_interface() {
        let iface = SerialInterface::new("/dev/ttyUSB0").with_baud_rate(57600);
        assert_eq!(iface.name(), "serial:/dev/ttyUSB0");
        assert_eq!(iface.state(), ConnectionState::Disconnected);
        assert!(!iface.is_connected());
        assert!(format!("{iface:?}").contains("57600"));
    }

    #[tokio::test]
    async fn test_connect_missing_port() {
        let mut iface = SerialInterface::new("/dev/does-not-exist");
        let err = iface.connect().await.unwrap_err();
        assert_eq!(err.error_code(), "PORT_NOT_FOUND");
        assert_eq!(iface.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_read_when_disconnected() {
        let mut iface = SerialInterface::new("/dev/null");
        assert!(matches!(
            iface.read_line().await,
            Err(RamsesError::Disconnected)
        ));
    }
}
