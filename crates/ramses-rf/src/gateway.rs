//! Gateway - the RAMSES-II service loop
//!
//! One task owns the interface, the [`CommandEngine`] and the
//! [`Dispatcher`]. Everyone else talks to it through a cloneable
//! [`GatewayHandle`]: submitting commands, awaiting their outcome and
//! subscribing to the stream of [`DispatchEvent`]s.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Gateway                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌─────────────┐  lines   ┌────────────┐   events  ┌───────┐ │
//! │  │  Interface  │─────────►│ Dispatcher │──────────►│ bcast │ │
//! │  │ (evofw3 /   │          │  decoder   │           └───────┘ │
//! │  │   HGI80)    │◄───┐     │  graph     │                     │
//! │  └─────────────┘    │     │  binding   │                     │
//! │                     │     └─────┬──────┘                     │
//! │              frames │           │ messages                   │
//! │                ┌────┴───────────▼──┐     ┌────────────────┐  │
//! │                │  CommandEngine    │◄────│ GatewayHandle  │  │
//! │                └───────────────────┘     └────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use ramses_rf::{Gateway, GatewayConfig};
//! use ramses_tx::{Command, SerialInterface};
//!
//! let config = GatewayConfig::from_file("ramses.json")?;
//! let interface = SerialInterface::from_config(&config.ramses.interface);
//! let (gateway, handle) = Gateway::new(interface, config);
//! tokio::spawn(gateway.run());
//!
//! let reply = handle.send_command("RQ 01:145038 0004 0100".parse()?).await?;
//! ```

use chrono::{NaiveDateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use ramses_tx::codec::Schedule;
use ramses_tx::{
    Address, Command, CommandEngine, CommandId, EngineStats, Message, RamsesInterface, Registry,
};

use crate::config::{BindingConfig, GatewayConfig};
use crate::dispatcher::{DispatchEvent, DispatchStats, Dispatcher};
use crate::error::{Result, RfError};
use crate::schema::SchemaSnapshot;

/// Capacity of the event broadcast; slow subscribers see `Lagged`
pub const EVENT_CHANNEL_SIZE: usize = 1024;

/// Longest the loop sleeps without a reason to wake
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

type Outcome = ramses_tx::Result<Message>;

/// Commands that can be sent to the gateway
#[derive(Debug)]
pub enum GatewayCommand {
    /// Queue a command; its id is returned on `id`
    Submit {
        command: Command,
        reply: oneshot::Sender<Outcome>,
        id: oneshot::Sender<CommandId>,
    },
    /// Cancel a command; `true` if it had not finished
    Cancel(CommandId, oneshot::Sender<bool>),
    /// Capture the learned topology
    Snapshot(oneshot::Sender<SchemaSnapshot>),
    /// Current entity state as JSON
    State(oneshot::Sender<serde_json::Value>),
    /// Keep a schedule read from or written to a controller
    StoreSchedule(Address, Schedule),
    /// Run a discovery round now
    Discover,
    /// Get gateway statistics
    GetStats(oneshot::Sender<GatewayStats>),
    /// Shutdown the gateway
    Shutdown,
}

/// Gateway statistics
#[derive(Debug, Clone, Default)]
pub struct GatewayStats {
    /// Frames written to the interface
    pub frames_written: u64,
    /// Probe commands queued by discovery
    pub probes_queued: u64,
    /// Decoding and graph counters
    pub dispatch: DispatchStats,
    /// Command engine counters
    pub engine: EngineStats,
}

/// A submitted command awaiting its outcome
#[derive(Debug)]
pub struct Submitted {
    /// Id for [`GatewayHandle::cancel`]
    pub id: CommandId,
    reply: oneshot::Receiver<Outcome>,
}

impl Submitted {
    /// Wait for the correlated reply (or the failure)
    ///
    /// Dropping this future abandons the command.
    pub async fn outcome(self) -> Result<Message> {
        Ok(self.reply.await??)
    }
}

/// Handle for controlling the Gateway
#[derive(Clone, Debug)]
pub struct GatewayHandle {
    command_tx: mpsc::Sender<GatewayCommand>,
    events: broadcast::Sender<DispatchEvent>,
    gateway_id: watch::Receiver<Address>,
    pub(crate) binding: BindingConfig,
}

impl GatewayHandle {
    /// Address the gateway transmits as
    ///
    /// The configured address until the gateway's first echo shows its own.
    pub fn gateway_id(&self) -> Address {
        *self.gateway_id.borrow()
    }

    /// Queue a command without waiting for its outcome
    pub async fn submit(&self, command: Command) -> Result<Submitted> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (id_tx, id_rx) = oneshot::channel();
        self.command_tx
            .send(GatewayCommand::Submit {
                command,
                reply: reply_tx,
                id: id_tx,
            })
            .await?;
        Ok(Submitted {
            id: id_rx.await?,
            reply: reply_rx,
        })
    }

    /// Send a command and wait for the message that answers it
    pub async fn send_command(&self, command: Command) -> Result<Message> {
        self.submit(command).await?.outcome().await
    }

    /// Cancel a queued or in-flight command
    pub async fn cancel(&self, id: CommandId) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(GatewayCommand::Cancel(id, tx)).await?;
        Ok(rx.await?)
    }

    /// Receive every event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    /// Capture the learned topology
    pub async fn snapshot(&self) -> Result<SchemaSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(GatewayCommand::Snapshot(tx)).await?;
        Ok(rx.await?)
    }

    /// Current entity state as JSON
    pub async fn state(&self) -> Result<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(GatewayCommand::State(tx)).await?;
        Ok(rx.await?)
    }

    pub(crate) async fn store_schedule(&self, ctl: Address, schedule: Schedule) -> Result<()> {
        self.command_tx
            .send(GatewayCommand::StoreSchedule(ctl, schedule))
            .await?;
        Ok(())
    }

    /// Run a discovery round now
    pub async fn discover(&self) -> Result<()> {
        self.command_tx.send(GatewayCommand::Discover).await?;
        Ok(())
    }

    /// Get gateway statistics
    pub async fn stats(&self) -> Result<GatewayStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(GatewayCommand::GetStats(tx)).await?;
        Ok(rx.await?)
    }

    /// Shutdown the gateway
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx.send(GatewayCommand::Shutdown).await?;
        Ok(())
    }
}

/// The gateway service
pub struct Gateway<I: RamsesInterface> {
    interface: I,
    config: GatewayConfig,
    engine: CommandEngine,
    dispatcher: Dispatcher,
    command_rx: mpsc::Receiver<GatewayCommand>,
    events: broadcast::Sender<DispatchEvent>,
    gateway_id: watch::Sender<Address>,
    stats: GatewayStats,
    /// Packet time at a tokio instant; lines without a timestamp are stamped from it
    clock: (Instant, NaiveDateTime),
    next_discovery: Option<Instant>,
    probes: Vec<(String, oneshot::Receiver<Outcome>)>,
}

impl<I: RamsesInterface + 'static> Gateway<I> {
    /// Create a gateway over `interface`
    pub fn new(interface: I, config: GatewayConfig) -> (Self, GatewayHandle) {
        let registry = Arc::new(Registry::new());
        let engine = CommandEngine::new(config.ramses.transport.clone(), registry.clone());
        let dispatcher = Dispatcher::new(&config, registry);

        let (command_tx, command_rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (gateway_id, gateway_id_rx) = watch::channel(engine.active_gateway());
        let handle = GatewayHandle {
            command_tx,
            events: events.clone(),
            gateway_id: gateway_id_rx,
            binding: config.binding.clone(),
        };

        let gateway = Self {
            interface,
            engine,
            dispatcher,
            command_rx,
            events,
            gateway_id,
            stats: GatewayStats::default(),
            clock: (Instant::now(), Utc::now().naive_utc()),
            next_discovery: None,
            probes: Vec::new(),
            config,
        };
        (gateway, handle)
    }

    /// Seed the entity graph before running
    pub fn load_snapshot(&mut self, snapshot: &SchemaSnapshot) {
        self.dispatcher.load_snapshot(snapshot);
    }

    /// Run the gateway service
    ///
    /// Returns when shut down through a handle, or with the error when the
    /// interface fails. Outstanding commands fail either way.
    pub async fn run(mut self) -> Result<()> {
        info!(interface = self.interface.name(), "Starting RAMSES gateway");
        self.interface.connect().await?;
        info!("Connected to gateway interface");

        if self.config.graph.discovery {
            self.next_discovery = Some(Instant::now());
        }

        let result = loop {
            if let Err(e) = self.transmit().await {
                break Err(e);
            }
            let wake = self.next_wake();

            tokio::select! {
                line = self.interface.read_line() => {
                    match line {
                        Ok(Some(line)) => self.handle_line(&line),
                        Ok(None) => trace!("No line available"),
                        Err(e) => {
                            error!(error = %e, "Interface read failed");
                            break Err(RfError::from(e));
                        }
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    if !self.handle_command(cmd) {
                        info!("Gateway shutdown requested");
                        break Ok(());
                    }
                }

                _ = tokio::time::sleep_until(wake) => self.on_timer(),
            }
        };

        let reason = match &result {
            Ok(()) => "gateway stopped".to_string(),
            Err(e) => e.to_string(),
        };
        self.engine.fail_all(&reason);

        if let Err(e) = self.interface.disconnect().await {
            warn!(error = %e, "Error disconnecting from interface");
        }
        info!("RAMSES gateway stopped");
        result
    }

    /// Packet time now
    fn now(&self) -> NaiveDateTime {
        let (at, dtm) = self.clock;
        dtm + chrono::Duration::from_std(at.elapsed()).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Write every frame the engine has due
    async fn transmit(&mut self) -> Result<()> {
        while let Some(frame) = self.engine.poll_transmit(Instant::now()) {
            trace!(frame = %frame, "Transmit");
            if let Err(e) = self.interface.write_frame(&frame).await {
                error!(error = %e, "Interface write failed");
                return Err(e.into());
            }
            self.stats.frames_written += 1;
        }
        Ok(())
    }

    fn next_wake(&mut self) -> Instant {
        let now = Instant::now();
        let expiry = self.dispatcher.next_expiry().map(|at| {
            // expiry is strict, so wake just after the deadline
            let ahead = (at - self.now()).to_std().unwrap_or(Duration::ZERO);
            now + ahead + Duration::from_millis(1)
        });
        [self.engine.next_deadline(), expiry, self.next_discovery]
            .into_iter()
            .flatten()
            .fold(now + HOUSEKEEPING_INTERVAL, Instant::min)
    }

    fn handle_line(&mut self, line: &str) {
        let received = self.now();
        let _ = self.events.send(DispatchEvent::Line {
            raw: line.trim_end().to_string(),
        });
        let events = self.dispatcher.process_line(line, received);
        self.publish(events);
    }

    fn publish(&mut self, events: Vec<DispatchEvent>) {
        for event in events {
            if let DispatchEvent::Message { message } = &event {
                if let Some(state) = self.engine.on_message(message) {
                    debug!(msg = %message, %state, "Message correlated");
                    // binding waiters match the events that follow against it
                    let active = self.engine.active_gateway();
                    self.gateway_id.send_if_modified(|id| {
                        let changed = *id != active;
                        *id = active;
                        changed
                    });
                }
            }
            // no subscribers is fine
            let _ = self.events.send(event);
        }
    }

    fn on_timer(&mut self) {
        let events = self.dispatcher.expire(self.now());
        self.publish(events);

        self.probes.retain_mut(|(label, rx)| match rx.try_recv() {
            Ok(Ok(_)) => false,
            Ok(Err(e)) => {
                debug!(probe = %label, error = %e, "Probe failed");
                false
            }
            Err(oneshot::error::TryRecvError::Empty) => true,
            Err(oneshot::error::TryRecvError::Closed) => false,
        });

        if self.next_discovery.is_some_and(|at| at <= Instant::now()) {
            self.discover();
            self.next_discovery = Some(Instant::now() + self.config.graph.discovery_interval);
        }
    }

    /// Queue probes for missing schema, unless the last round is still running
    fn discover(&mut self) {
        if !self.probes.is_empty() {
            debug!(pending = self.probes.len(), "Discovery round still running");
            return;
        }
        let commands = self.dispatcher.graph().probe_commands();
        info!(probes = commands.len(), "Discovery round");
        for command in commands {
            let (tx, rx) = oneshot::channel();
            let label = command.to_string();
            self.engine.submit(command, tx);
            self.probes.push((label, rx));
            self.stats.probes_queued += 1;
        }
    }

    /// Handle a command from a handle; returns false to stop
    fn handle_command(&mut self, cmd: GatewayCommand) -> bool {
        match cmd {
            GatewayCommand::Submit { command, reply, id } => {
                let _ = id.send(self.engine.submit(command, reply));
            }
            GatewayCommand::Cancel(id, reply) => {
                let _ = reply.send(self.engine.cancel(id));
            }
            GatewayCommand::Snapshot(tx) => {
                let _ = tx.send(self.dispatcher.graph().snapshot());
            }
            GatewayCommand::State(tx) => {
                let _ = tx.send(self.dispatcher.graph().state_json());
            }
            GatewayCommand::StoreSchedule(ctl, schedule) => {
                let changes = self.dispatcher.graph_mut().store_schedule(ctl, schedule);
                self.publish(changes.into_iter().map(DispatchEvent::Graph).collect());
            }
            GatewayCommand::Discover => self.discover(),
            GatewayCommand::GetStats(tx) => {
                let mut stats = self.stats.clone();
                stats.dispatch = self.dispatcher.stats().clone();
                stats.engine = self.engine.stats().clone();
                let _ = tx.send(stats);
            }
            GatewayCommand::Shutdown => return false,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ramses_tx::{Code, Payload, TestFixture};

    fn gateway(fixture: TestFixture) -> (Gateway<ramses_tx::MockInterface>, GatewayHandle) {
        let config = GatewayConfig {
            ramses: fixture.config,
            ..GatewayConfig::default()
        };
        Gateway::new(fixture.interface, config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_lines_reach_subscribers() {
        let fixture = TestFixture::new();
        let mock = fixture.handle.clone();
        let (gateway, handle) = gateway(fixture);
        let mut events = handle.subscribe();
        let task = tokio::spawn(gateway.run());

        mock.inject(" I --- 01:145038 --:------ 01:145038 30C9 003 0107C1");
        let message = loop {
            if let DispatchEvent::Message { message } = events.recv().await.unwrap() {
                break message;
            }
        };
        assert_eq!(message.code, Code::TEMPERATURE);
        assert!(matches!(message.payload, Payload::Temperatures(_)));

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.dispatch.messages, 1);

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_fails_after_shutdown() {
        let (gateway, handle) = gateway(TestFixture::new());
        let task = tokio::spawn(gateway.run());
        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();

        let err = handle.stats().await.unwrap_err();
        assert_eq!(err.error_code(), "GATEWAY_STOPPED");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_ends_loop_and_fails_commands() {
        let mut fixture = TestFixture::new();
        fixture.interface.error_on_read(Some(2));
        let (gateway, handle) = gateway(fixture);
        let task = tokio::spawn(gateway.run());

        // first read waits until the command is written and echoed
        let outcome = handle
            .send_command(Command::get_zone_name("01:145038".parse().unwrap(), 1))
            .await;
        assert!(outcome.is_err());

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.error_code(), "READ_ERROR");
    }
}
