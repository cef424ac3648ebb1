//! Test utilities
//!
//! [`MockInterface`] stands in for a gateway. Lines are injected through a
//! [`MockHandle`] that stays with the test after the interface has been moved
//! into a processing task; the handle also records every frame written.
//!
//! The mock can echo each written frame back (as a real gateway does, with
//! its own address in place of the `18:000730` placeholder) and run a
//! responder that plays the part of the addressed device.
//!
//! # Example
//!
//! ```rust,ignore
//! let (iface, handle) = MockInterface::new();
//! let iface = iface.with_echo().with_responder(|frame| {
//!     frame.starts_with("RQ").then(|| vec![reply.to_string()]).unwrap_or_default()
//! });
//! handle.inject(" I --- 04:056053 --:------ 01:145038 30C9 003 0007C1");
//! ```

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

use crate::address::Address;
use crate::config::{RamsesConfig, TransportConfig};
use crate::error::{RamsesError, Result};
use crate::interface::RamsesInterface;

/// Maps a written frame to the lines the simulated devices send back
pub type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

/// In-memory gateway interface
pub struct MockInterface {
    connected: bool,
    incoming_rx: mpsc::UnboundedReceiver<String>,
    incoming_tx: mpsc::UnboundedSender<String>,
    outgoing: Arc<Mutex<Vec<String>>>,
    echo: bool,
    /// Address written over the placeholder in echoes
    echo_as: Option<Address>,
    responder: Option<Responder>,
    simulate_errors: bool,
    error_on_nth_read: Option<usize>,
    read_count: usize,
}

/// Test-side handle of a [`MockInterface`]
#[derive(Clone)]
pub struct MockHandle {
    incoming: mpsc::UnboundedSender<String>,
    outgoing: Arc<Mutex<Vec<String>>>,
}

impl MockInterface {
    /// Create a mock interface and its handle
    pub fn new() -> (Self, MockHandle) {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let outgoing = Arc::new(Mutex::new(Vec::new()));
        let handle = MockHandle {
            incoming: incoming_tx.clone(),
            outgoing: Arc::clone(&outgoing),
        };
        let iface = Self {
            connected: false,
            incoming_rx,
            incoming_tx,
            outgoing,
            echo: false,
            echo_as: None,
            responder: None,
            simulate_errors: false,
            error_on_nth_read: None,
            read_count: 0,
        };
        (iface, handle)
    }

    /// Echo each written frame back as received
    pub fn with_echo(mut self) -> Self {
        self.echo = true;
        self
    }

    /// Echo each written frame as a gateway whose own address is `gateway`
    pub fn with_echo_as(mut self, gateway: Address) -> Self {
        self.echo = true;
        self.echo_as = Some(gateway);
        self
    }

    /// Answer written frames with the lines `responder` returns
    pub fn with_responder(mut self, responder: impl FnMut(&str) -> Vec<String> + Send + 'static) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Configure to simulate errors
    pub fn simulate_errors(&mut self, enabled: bool) {
        self.simulate_errors = enabled;
    }

    /// Configure to error on the Nth read
    pub fn error_on_read(&mut self, n: Option<usize>) {
        self.error_on_nth_read = n;
        self.read_count = 0;
    }
}

impl MockHandle {
    /// Queue a line as if the gateway had reported it
    pub fn inject(&self, line: impl Into<String>) {
        let _ = self.incoming.send(line.into());
    }

    /// Frames written so far
    pub fn written(&self) -> Vec<String> {
        self.outgoing.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Clear the record of written frames
    pub fn clear_written(&self) {
        if let Ok(mut written) = self.outgoing.lock() {
            written.clear();
        }
    }
}

#[async_trait]
impl RamsesInterface for MockInterface {
    async fn connect(&mut self) -> Result<()> {
        if self.simulate_errors {
            return Err(RamsesError::PortNotFound("mock".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        self.read_count += 1;

        if let Some(n) = self.error_on_nth_read {
            if self.read_count == n {
                return Err(RamsesError::ReadError("Simulated error".to_string()));
            }
        }

        if self.simulate_errors {
            return Err(RamsesError::Disconnected);
        }

        // the interface holds a sender itself, so this only waits
        match self.incoming_rx.recv().await {
            Some(line) => Ok(Some(line)),
            None => Err(RamsesError::Disconnected),
        }
    }

    async fn write_frame(&mut self, frame: &str) -> Result<()> {
        if self.simulate_errors {
            return Err(RamsesError::WriteError("Simulated error".to_string()));
        }
        trace!(frame = %frame, "Mock write");
        if let Ok(mut written) = self.outgoing.lock() {
            written.push(frame.to_string());
        }
        if self.echo {
            let echo = match self.echo_as {
                Some(gateway) => frame.replace(&Address::GATEWAY.to_string(), &gateway.to_string()),
                None => frame.to_string(),
            };
            let _ = self.incoming_tx.send(echo);
        }
        if let Some(responder) = self.responder.as_mut() {
            for line in responder(frame) {
                let _ = self.incoming_tx.send(line);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "MockInterface"
    }
}

impl std::fmt::Debug for MockInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockInterface")
            .field("connected", &self.connected)
            .field("echo", &self.echo)
            .field("echo_as", &self.echo_as)
            .field("responder", &self.responder.is_some())
            .finish()
    }
}

/// Test fixture for creating pre-configured test scenarios
pub struct TestFixture {
    /// Mock interface
    pub interface: MockInterface,
    /// Handle to the mock interface
    pub handle: MockHandle,
    /// Test configuration
    pub config: RamsesConfig,
}

impl TestFixture {
    /// Create a basic test fixture: echoing interface, no gap, no jitter
    pub fn new() -> Self {
        let (interface, handle) = MockInterface::new();
        let config = RamsesConfig {
            transport: TransportConfig {
                min_gap: std::time::Duration::ZERO,
                ..TransportConfig::default()
            },
            ..RamsesConfig::default()
        };
        Self {
            interface: interface.with_echo(),
            handle,
            config,
        }
    }

    /// Create with pre-populated incoming lines
    pub fn with_incoming_lines(lines: &[&str]) -> Self {
        let fixture = Self::new();
        for line in lines {
            fixture.handle.inject(*line);
        }
        fixture
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_interface_basic() {
        let (mut mock, handle) = MockInterface::new();
        assert!(!mock.is_connected());
        mock.connect().await.unwrap();
        assert!(mock.is_connected());

        handle.inject("line 1");
        assert_eq!(mock.read_line().await.unwrap().as_deref(), Some("line 1"));
    }

    #[tokio::test]
    async fn test_mock_echo_and_responder() {
        let (mock, handle) = MockInterface::new();
        let mut mock = mock
            .with_echo()
            .with_responder(|frame| vec![format!("reply to {frame}")]);
        mock.write_frame("RQ frame").await.unwrap();

        assert_eq!(handle.written(), vec!["RQ frame".to_string()]);
        assert_eq!(mock.read_line().await.unwrap().as_deref(), Some("RQ frame"));
        assert_eq!(
            mock.read_line().await.unwrap().as_deref(),
            Some("reply to RQ frame")
        );
        handle.clear_written();
        assert!(handle.written().is_empty());
    }

    #[tokio::test]
    async fn test_mock_echo_as_real_gateway() {
        let (mock, _handle) = MockInterface::new();
        let mut mock = mock.with_echo_as("18:006402".parse().unwrap());
        mock.write_frame(" I --- 18:000730 --:------ 18:000730 1FC9 006 0022F106368E")
            .await
            .unwrap();
        assert_eq!(
            mock.read_line().await.unwrap().as_deref(),
            Some(" I --- 18:006402 --:------ 18:006402 1FC9 006 0022F106368E")
        );
    }

    #[tokio::test]
    async fn test_mock_simulated_errors() {
        let (mut mock, _handle) = MockInterface::new();
        mock.error_on_read(Some(2));
        mock.simulate_errors(false);
        let _ = tokio::time::timeout(std::time::Duration::from_millis(1), mock.read_line()).await;
        assert!(matches!(
            mock.read_line().await,
            Err(RamsesError::ReadError(_))
        ));

        mock.simulate_errors(true);
        assert!(mock.connect().await.is_err());
        assert!(mock.write_frame("x").await.is_err());
    }

    #[test]
    fn test_fixture_defaults() {
        let fixture = TestFixture::with_incoming_lines(&["a", "b"]);
        assert_eq!(fixture.config.transport.min_gap, std::time::Duration::ZERO);
        assert_eq!(fixture.interface.name(), "MockInterface");
    }
}
