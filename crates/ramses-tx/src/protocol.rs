//! Command engine: transmit scheduling, correlation and retries
//!
//! The [`CommandEngine`] owns every outbound command from submission until
//! its caller is told the outcome. It performs no I/O itself: the task that
//! owns the interface asks it for the next frame to write
//! ([`poll_transmit`](CommandEngine::poll_transmit)), feeds it every decoded
//! message ([`on_message`](CommandEngine::on_message)) and sleeps until
//! [`next_deadline`](CommandEngine::next_deadline).
//!
//! ```text
//! Queued ──► Sent ──► AwaitingResponse ──► Resolved
//!              ▲  │          │
//!              │  └──────────┴──► Retrying ──┘ (or Failed when exhausted)
//! ```
//!
//! One command is in flight at a time. Transmissions keep a minimum gap and
//! draw from a duty-cycle token bucket.

use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::address::Address;
use crate::codec::Registry;
use crate::command::{correlate, Command, CommandClass, Correlation};
use crate::config::TransportConfig;
use crate::error::{RamsesError, Result};
use crate::message::Message;
use crate::packet::{Packet, Verb};

/// Identifies a submitted command
pub type CommandId = u64;

/// Where the outcome of a command is delivered
pub type CommandReply = oneshot::Sender<Result<Message>>;

/// Lifecycle of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Queued,
    Sent,
    AwaitingResponse,
    Retrying,
    Resolved,
    Failed,
    Cancelled,
}

impl std::fmt::Display for CommandState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandState::Queued => write!(f, "queued"),
            CommandState::Sent => write!(f, "sent"),
            CommandState::AwaitingResponse => write!(f, "awaiting response"),
            CommandState::Retrying => write!(f, "retrying"),
            CommandState::Resolved => write!(f, "resolved"),
            CommandState::Failed => write!(f, "failed"),
            CommandState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Engine statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Commands accepted into the queue
    pub submitted: u64,
    /// Frames written (including retransmissions)
    pub transmitted: u64,
    /// Retransmissions
    pub retries: u64,
    /// Commands resolved with a correlated message
    pub resolved: u64,
    /// Commands that failed (encode errors, exhausted retries)
    pub failed: u64,
    /// Commands cancelled by their caller
    pub cancelled: u64,
    /// Commands whose caller went away before the outcome
    pub abandoned: u64,
}

#[derive(Debug)]
struct PendingCommand {
    id: CommandId,
    seq: u64,
    command: Command,
    packet: Packet,
    reply: CommandReply,
    state: CommandState,
    attempts: u8,
    max_retries: u8,
    timeout: Duration,
    /// Response deadline while in flight; retransmit time while retrying
    deadline: Instant,
}

impl PendingCommand {
    fn label(&self) -> String {
        format!("{} #{}", self.command, self.id)
    }

    /// Response timeout of the current attempt
    fn attempt_timeout(&self, backoff: bool) -> Duration {
        if backoff && self.attempts > 0 {
            self.timeout * (1u32 << (self.attempts - 1).min(2))
        } else {
            self.timeout
        }
    }
}

/// Token bucket limiting transmissions per window
#[derive(Debug)]
struct DutyCycle {
    capacity: f64,
    tokens: f64,
    per_second: f64,
    updated: Instant,
}

impl DutyCycle {
    fn new(config: &TransportConfig, now: Instant) -> Self {
        let capacity = f64::from(config.duty_cycle_tokens);
        let window = config.duty_cycle_window.as_secs_f64();
        Self {
            capacity,
            tokens: capacity,
            per_second: if window > 0.0 { capacity / window } else { 0.0 },
            updated: now,
        }
    }

    fn is_limited(&self) -> bool {
        self.capacity > 0.0
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.per_second).min(self.capacity);
        self.updated = now;
    }

    /// When a token is (or will be) available
    fn ready_at(&mut self, now: Instant) -> Instant {
        if !self.is_limited() {
            return now;
        }
        self.refill(now);
        if self.tokens >= 1.0 || self.per_second <= 0.0 {
            return now;
        }
        now + Duration::from_secs_f64((1.0 - self.tokens) / self.per_second)
    }

    fn take(&mut self, now: Instant) {
        if self.is_limited() {
            self.refill(now);
            self.tokens = (self.tokens - 1.0).max(0.0);
        }
    }
}

/// Outbound command scheduler and correlator
#[derive(Debug)]
pub struct CommandEngine {
    config: TransportConfig,
    registry: Arc<Registry>,
    queue: Vec<PendingCommand>,
    in_flight: Option<PendingCommand>,
    /// Address the gateway really transmits as, learned from an echo
    active_gateway: Option<Address>,
    last_tx: Option<Instant>,
    duty_cycle: DutyCycle,
    next_id: CommandId,
    next_seq: u64,
    stats: EngineStats,
}

impl CommandEngine {
    /// Create an engine
    pub fn new(config: TransportConfig, registry: Arc<Registry>) -> Self {
        let duty_cycle = DutyCycle::new(&config, Instant::now());
        Self {
            config,
            registry,
            queue: Vec::new(),
            in_flight: None,
            active_gateway: None,
            last_tx: None,
            duty_cycle,
            next_id: 1,
            next_seq: 0,
            stats: EngineStats::default(),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Address the gateway transmits as
    ///
    /// A gateway replaces the configured placeholder with its own address
    /// when it sends a frame; once an echo has shown that address it is used
    /// here, otherwise the configured one.
    pub fn active_gateway(&self) -> Address {
        self.active_gateway.unwrap_or(self.config.gateway_id)
    }

    /// Commands waiting to be sent
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is queued or in flight
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_none()
    }

    /// Current state of a command that has not yet finished
    pub fn state(&self, id: CommandId) -> Option<CommandState> {
        self.in_flight
            .iter()
            .chain(self.queue.iter())
            .find(|p| p.id == id)
            .map(|p| p.state)
    }

    /// Timeout a command waits for before retrying
    fn timeout_for(&self, command: &Command) -> Duration {
        command.timeout.unwrap_or(match command.class {
            CommandClass::Probe => self.config.timeouts.probe,
            CommandClass::Control => self.config.timeouts.control,
            CommandClass::Binding => self.config.timeouts.binding,
        })
    }

    /// Accept a command
    ///
    /// The command is encoded immediately; an encode failure (or a full
    /// queue) is delivered to `reply` without the command ever being sent.
    pub fn submit(&mut self, command: Command, reply: CommandReply) -> CommandId {
        let id = self.next_id;
        self.next_id += 1;

        if self.queue.len() >= self.config.queue_size {
            warn!(command = %command, "Command queue full");
            self.stats.failed += 1;
            let _ = reply.send(Err(RamsesError::QueueFull(self.queue.len())));
            return id;
        }

        let packet = match command.to_packet(
            &self.registry,
            self.config.gateway_id,
            Utc::now().naive_utc(),
        ) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(command = %command, error = %e, "Command failed to encode");
                self.stats.failed += 1;
                let _ = reply.send(Err(e));
                return id;
            }
        };

        let max_retries = command
            .max_retries
            .unwrap_or(self.config.max_retries)
            .min(crate::config::MAX_RETRY_LIMIT);
        let timeout = self.timeout_for(&command);
        debug!(id, command = %command, priority = ?command.priority, "Command queued");

        self.queue.push(PendingCommand {
            id,
            seq: self.next_seq,
            command,
            packet,
            reply,
            state: CommandState::Queued,
            attempts: 0,
            max_retries,
            timeout,
            deadline: Instant::now(),
        });
        self.next_seq += 1;
        self.stats.submitted += 1;
        id
    }

    /// Cancel a queued or in-flight command; returns false if it has finished
    pub fn cancel(&mut self, id: CommandId) -> bool {
        let pending = if self.in_flight.as_ref().is_some_and(|p| p.id == id) {
            self.in_flight.take()
        } else {
            self.queue
                .iter()
                .position(|p| p.id == id)
                .map(|i| self.queue.remove(i))
        };
        match pending {
            Some(pending) => {
                let label = pending.label();
                info!(command = %label, state = %pending.state, "Command cancelled");
                self.stats.cancelled += 1;
                let _ = pending.reply.send(Err(RamsesError::Cancelled(label)));
                true
            }
            None => false,
        }
    }

    /// Earliest time [`poll_transmit`](Self::poll_transmit) has work to do
    pub fn next_deadline(&mut self) -> Option<Instant> {
        let now = Instant::now();
        match self.in_flight.as_ref().map(|p| (p.state, p.deadline)) {
            Some((CommandState::Retrying, deadline)) => Some(self.transmit_at(now).max(deadline)),
            Some((_, deadline)) => Some(deadline),
            None if self.queue.is_empty() => None,
            None => Some(self.transmit_at(now)),
        }
    }

    /// Earliest time the gap and duty cycle allow a transmission
    fn transmit_at(&mut self, now: Instant) -> Instant {
        let gap_ready = self
            .last_tx
            .map_or(now, |last| (last + self.config.min_gap).max(now));
        gap_ready.max(self.duty_cycle.ready_at(now))
    }

    /// Advance timers and return the next frame to write, if any
    pub fn poll_transmit(&mut self, now: Instant) -> Option<String> {
        self.check_timeout(now);
        self.drop_abandoned();

        if self.in_flight.is_none() {
            let next = self
                .queue
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    a.command
                        .priority
                        .cmp(&b.command.priority)
                        .then(b.seq.cmp(&a.seq))
                })
                .map(|(i, _)| i)?;
            if self.transmit_at(now) > now {
                return None;
            }
            self.in_flight = Some(self.queue.remove(next));
        } else if self
            .in_flight
            .as_ref()
            .is_some_and(|p| p.state != CommandState::Retrying || p.deadline > now)
            || self.transmit_at(now) > now
        {
            return None;
        }

        let pending = self.in_flight.as_mut()?;
        if pending.attempts > 0 {
            self.stats.retries += 1;
        }
        pending.attempts += 1;
        pending.state = CommandState::Sent;
        pending.deadline = now + pending.attempt_timeout(self.config.backoff);
        self.last_tx = Some(now);
        self.duty_cycle.take(now);
        self.stats.transmitted += 1;

        let frame = pending.packet.frame();
        debug!(
            command = %pending.label(),
            attempt = pending.attempts,
            frame = %frame,
            "Transmitting"
        );
        Some(frame)
    }

    /// Handle an expired response deadline
    fn check_timeout(&mut self, now: Instant) {
        let Some(pending) = self.in_flight.as_mut() else {
            return;
        };
        if pending.state == CommandState::Retrying || pending.deadline > now {
            return;
        }

        if pending.attempts > pending.max_retries {
            let Some(pending) = self.in_flight.take() else {
                return;
            };
            let label = pending.label();
            let attempts = pending.attempts;
            warn!(command = %label, attempts, "Retries exhausted");
            self.stats.failed += 1;
            let reason = RamsesError::CorrelationTimeout {
                command: pending.command.to_string(),
                elapsed_ms: pending.attempt_timeout(self.config.backoff).as_millis() as u64,
            };
            let _ = pending.reply.send(Err(RamsesError::RetryExhausted {
                command: label,
                attempts,
                reason: reason.to_string(),
            }));
            return;
        }

        let jitter = self.config.retry_jitter.as_millis() as u64;
        let delay = if jitter > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter))
        } else {
            Duration::ZERO
        };
        warn!(
            command = %pending.label(),
            attempt = pending.attempts,
            max_retries = pending.max_retries,
            "No response, retrying"
        );
        pending.state = CommandState::Retrying;
        pending.deadline = now + delay;
    }

    /// Discard commands whose caller is no longer waiting
    fn drop_abandoned(&mut self) {
        let before = self.queue.len();
        self.queue.retain(|p| !p.reply.is_closed());
        let mut dropped = before - self.queue.len();
        if self.in_flight.as_ref().is_some_and(|p| p.reply.is_closed()) {
            if let Some(pending) = self.in_flight.take() {
                trace!(command = %pending.label(), "Caller gone, dropping in-flight command");
            }
            dropped += 1;
        }
        self.stats.abandoned += dropped as u64;
    }

    /// Check a decoded message against the in-flight command
    ///
    /// Returns the state the command moved to, if the message correlated.
    pub fn on_message(&mut self, msg: &Message) -> Option<CommandState> {
        let pending = self.in_flight.as_mut()?;
        let correlation = correlate(&pending.packet, msg.packet())?;
        if correlation == Correlation::Echo
            && pending.packet.src() == self.config.gateway_id
            && msg.src != self.config.gateway_id
            && self.active_gateway != Some(msg.src)
        {
            info!(gateway = %msg.src, configured = %self.config.gateway_id, "Active gateway address learned");
            self.active_gateway = Some(msg.src);
        }
        if correlation == Correlation::Echo && pending.packet.verb() != Verb::I {
            if pending.state != CommandState::Sent {
                return None;
            }
            trace!(command = %pending.label(), "Echo received");
            pending.state = CommandState::AwaitingResponse;
            return Some(CommandState::AwaitingResponse);
        }
        let pending = self.in_flight.take()?;
        debug!(command = %pending.label(), attempts = pending.attempts, "Command resolved");
        self.stats.resolved += 1;
        if pending.reply.send(Ok(msg.clone())).is_err() {
            self.stats.abandoned += 1;
        }
        Some(CommandState::Resolved)
    }

    /// Fail every outstanding command, e.g. when the transport closes
    pub fn fail_all(&mut self, reason: &str) {
        let pending: Vec<PendingCommand> = self
            .in_flight
            .take()
            .into_iter()
            .chain(self.queue.drain(..))
            .collect();
        for p in pending {
            self.stats.failed += 1;
            let command = p.label();
            let attempts = p.attempts;
            let _ = p.reply.send(Err(RamsesError::RetryExhausted {
                command,
                attempts,
                reason: reason.to_string(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Priority;
    use crate::config::FragmentConfig;
    use crate::message::{Decoding, MessageDecoder};
    use crate::packet::Code;

    fn engine(config: TransportConfig) -> CommandEngine {
        CommandEngine::new(config, Arc::new(Registry::new()))
    }

    fn message(line: &str) -> Message {
        let mut decoder = MessageDecoder::new(Arc::new(Registry::new()), &FragmentConfig::default());
        let out = decoder.decode_line(line, Utc::now().naive_utc()).unwrap();
        match out.into_iter().next() {
            Some(Decoding::Message(msg)) => msg,
            other => panic!("unexpected decoding: {other:?}"),
        }
    }

    fn ctl() -> crate::Address {
        "01:145038".parse().unwrap()
    }

    const ZONE_NAME_RP: &str =
        "RP --- 01:145038 18:006402 --:------ 0004 022 0100486F6D6500000000000000000000000000000000";

    #[tokio::test(start_paused = true)]
    async fn test_request_resolves_on_reply() {
        let mut engine = engine(TransportConfig::default());
        let (tx, rx) = oneshot::channel();
        let id = engine.submit(Command::get_zone_name(ctl(), 1), tx);
        assert_eq!(engine.state(id), Some(CommandState::Queued));

        let frame = engine.poll_transmit(Instant::now()).unwrap();
        assert_eq!(frame, "RQ --- 18:000730 01:145038 --:------ 0004 002 0100");
        assert_eq!(engine.state(id), Some(CommandState::Sent));

        let echo = message("RQ --- 18:006402 01:145038 --:------ 0004 002 0100");
        assert_eq!(engine.on_message(&echo), Some(CommandState::AwaitingResponse));

        assert_eq!(engine.on_message(&message(ZONE_NAME_RP)), Some(CommandState::Resolved));
        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.code, Code::ZONE_NAME);
        assert!(engine.is_idle());
        assert_eq!(engine.stats().resolved, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_reveals_gateway_address() {
        let mut engine = engine(TransportConfig::default());
        assert_eq!(engine.active_gateway().to_string(), "18:000730");

        let (tx, _rx) = oneshot::channel();
        engine.submit(Command::get_zone_name(ctl(), 1), tx);
        engine.poll_transmit(Instant::now()).unwrap();
        // another gateway's traffic teaches nothing
        let other = message("RQ --- 18:013393 01:145038 --:------ 0004 002 0200");
        assert_eq!(engine.on_message(&other), None);
        assert_eq!(engine.active_gateway().to_string(), "18:000730");

        let echo = message("RQ --- 18:006402 01:145038 --:------ 0004 002 0100");
        assert_eq!(engine.on_message(&echo), Some(CommandState::AwaitingResponse));
        assert_eq!(engine.active_gateway().to_string(), "18:006402");
    }

    #[tokio::test(start_paused = true)]
    async fn test_encode_failure_never_sent() {
        let mut engine = engine(TransportConfig::default());
        let (tx, rx) = oneshot::channel();
        let cmd: Command = "RQ 01:145038 7FFF 00".parse().unwrap();
        let id = engine.submit(cmd, tx);

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.error_code(), "CODEC_ERROR");
        assert_eq!(engine.state(id), None);
        assert!(engine.poll_transmit(Instant::now()).is_none());
        assert_eq!(engine.stats().transmitted, 0);
        assert_eq!(engine.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_fails() {
        let mut config = TransportConfig::default();
        config.max_retries = 2;
        config.backoff = false;
        let mut engine = engine(config);
        let (tx, rx) = oneshot::channel();
        let id = engine.submit(Command::get_zone_name(ctl(), 1), tx);

        let start = Instant::now();
        assert!(engine.poll_transmit(start).is_some());
        assert!(engine.poll_transmit(start + Duration::from_millis(499)).is_none());

        for attempt in 2..=3u64 {
            let deadline = engine.next_deadline().unwrap();
            assert!(engine.poll_transmit(deadline).is_some(), "attempt {attempt}");
            assert_eq!(engine.state(id), Some(CommandState::Sent));
        }
        assert_eq!(engine.stats().retries, 2);

        let deadline = engine.next_deadline().unwrap();
        assert!(engine.poll_transmit(deadline).is_none());
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, RamsesError::RetryExhausted { attempts: 3, .. }));
        assert!(engine.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reports_last_timeout() {
        let mut config = TransportConfig::default();
        config.max_retries = 1;
        config.retry_jitter = Duration::ZERO;
        let mut engine = engine(config);
        let (tx, rx) = oneshot::channel();
        engine.submit(Command::get_zone_name(ctl(), 1), tx);

        for _ in 0..2 {
            let at = engine.next_deadline().unwrap();
            assert!(engine.poll_transmit(at).is_some());
        }
        let at = engine.next_deadline().unwrap();
        assert!(engine.poll_transmit(at).is_none());

        let RamsesError::RetryExhausted { attempts, reason, .. } = rx.await.unwrap().unwrap_err() else {
            panic!("expected exhausted retries");
        };
        assert_eq!(attempts, 2);
        // the second attempt waited twice the base timeout
        assert!(reason.ends_with("within 1000ms"), "{reason}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_timeout() {
        let mut engine = engine(TransportConfig::default());
        let (tx, _rx) = oneshot::channel();
        engine.submit(Command::get_zone_name(ctl(), 1), tx);

        let t0 = Instant::now();
        engine.poll_transmit(t0).unwrap();
        assert_eq!(engine.next_deadline(), Some(t0 + Duration::from_millis(500)));

        let t1 = t0 + Duration::from_millis(500);
        engine.poll_transmit(t1).unwrap();
        assert_eq!(engine.next_deadline(), Some(t1 + Duration::from_millis(1000)));

        let t2 = t1 + Duration::from_millis(1000);
        engine.poll_transmit(t2).unwrap();
        assert_eq!(engine.next_deadline(), Some(t2 + Duration::from_millis(2000)));

        // capped at four times the base timeout
        let t3 = t2 + Duration::from_millis(2000);
        engine.poll_transmit(t3).unwrap();
        assert_eq!(engine.next_deadline(), Some(t3 + Duration::from_millis(2000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_then_fifo() {
        let mut config = TransportConfig::default();
        config.min_gap = Duration::ZERO;
        let mut engine = engine(config);
        let mut receivers = Vec::new();
        for (zone, priority) in [(1, Priority::Low), (2, Priority::High), (3, Priority::High)] {
            let (tx, rx) = oneshot::channel();
            receivers.push(rx);
            engine.submit(Command::get_zone_name(ctl(), zone).with_priority(priority), tx);
        }

        let mut order = Vec::new();
        for _ in 0..3 {
            let frame = engine.poll_transmit(Instant::now()).unwrap();
            order.push(frame[frame.len() - 4..].to_string());
            let id = engine.in_flight.as_ref().unwrap().id;
            engine.cancel(id);
        }
        assert_eq!(order, vec!["0200", "0300", "0100"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_gap_between_commands() {
        let mut engine = engine(TransportConfig::default());
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        engine.submit(Command::get_zone_name(ctl(), 1), tx1);
        engine.submit(Command::get_zone_name(ctl(), 2), tx2);

        let t0 = Instant::now();
        engine.poll_transmit(t0).unwrap();
        engine.on_message(&message(ZONE_NAME_RP)).unwrap();

        assert!(engine.poll_transmit(t0 + Duration::from_millis(10)).is_none());
        assert_eq!(engine.next_deadline(), Some(t0 + Duration::from_millis(50)));
        assert!(engine.poll_transmit(t0 + Duration::from_millis(50)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duty_cycle_budget() {
        let mut config = TransportConfig::default();
        config.min_gap = Duration::ZERO;
        config.duty_cycle_tokens = 2;
        config.duty_cycle_window = Duration::from_secs(10);
        let mut engine = engine(config);
        let t0 = Instant::now();
        let mut receivers = Vec::new();
        for zone in 0..3 {
            let (tx, rx) = oneshot::channel();
            receivers.push(rx);
            engine.submit(Command::get_zone_name(ctl(), zone), tx);
        }

        for _ in 0..2 {
            assert!(engine.poll_transmit(t0).is_some());
            let id = engine.in_flight.as_ref().unwrap().id;
            engine.cancel(id);
        }
        assert!(engine.poll_transmit(t0).is_none());
        // one token every five seconds
        assert_eq!(engine.next_deadline(), Some(t0 + Duration::from_secs(5)));
        assert!(engine.poll_transmit(t0 + Duration::from_secs(5)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_in_flight() {
        let mut engine = engine(TransportConfig::default());
        let (tx, rx) = oneshot::channel();
        let id = engine.submit(Command::get_zone_name(ctl(), 1), tx);
        engine.poll_transmit(Instant::now()).unwrap();

        assert!(engine.cancel(id));
        assert!(!engine.cancel(id));
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.error_code(), "CANCELLED");
        // a late reply no longer correlates
        assert_eq!(engine.on_message(&message(ZONE_NAME_RP)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_caller_is_skipped() {
        let mut engine = engine(TransportConfig::default());
        let (tx, rx) = oneshot::channel();
        engine.submit(Command::get_zone_name(ctl(), 1), tx);
        drop(rx);
        assert!(engine.poll_transmit(Instant::now()).is_none());
        assert!(engine.is_idle());
        assert_eq!(engine.stats().abandoned, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_info_resolves_on_echo() {
        let mut engine = engine(TransportConfig::default());
        let (tx, rx) = oneshot::channel();
        let supplicant: crate::Address = "29:123150".parse().unwrap();
        engine.submit(
            Command::put_bind(
                Verb::I,
                supplicant,
                supplicant,
                vec![crate::codec::BindTuple(
                    crate::helpers::HexByte(0),
                    Code::FAN_MODE,
                    supplicant,
                )],
            ),
            tx,
        );
        engine.poll_transmit(Instant::now()).unwrap();
        let echo = message(" I --- 29:123150 --:------ 29:123150 1FC9 006 0022F175E10E");
        assert_eq!(engine.on_message(&echo), Some(CommandState::Resolved));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_queue_full() {
        let mut config = TransportConfig::default();
        config.queue_size = 1;
        let mut engine = engine(config);
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        engine.submit(Command::get_zone_name(ctl(), 1), tx1);
        engine.submit(Command::get_zone_name(ctl(), 2), tx2);
        let err = rx2.await.unwrap().unwrap_err();
        assert_eq!(err.error_code(), "QUEUE_FULL");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CommandState::AwaitingResponse.to_string(), "awaiting response");
    }
}
