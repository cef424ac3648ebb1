//! Binding handshake tracker
//!
//! Follows `1FC9` traffic through offer, accept and confirm:
//!
//! ```text
//! Idle ──offer──► OfferReceived ──accept──► AcceptSent ──confirm──► ConfirmReceived ──► Bound
//!                      │                         │
//!                      └──────── timeout ────────┴──► TimedOut
//! ```
//!
//! One attempt is tracked per supplicant; a new offer from the same
//! supplicant starts over. Deadlines run on packet time, so a recorded
//! stream times out the same way it did live. A completed binding is never
//! moved by messages from the exchange that completed it.
//!
//! Replays are recognised by packet time. Lines without a timestamp of their
//! own are stamped on receipt, so a repeated offer heard live opens a new
//! attempt; the [`BindingRecord`] and the `Bound` state only change if that
//! attempt completes a handshake of its own.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use ramses_tx::codec::{BindPhase, BindTuple, RfBind};
use ramses_tx::{Address, Code, Command, HexByte, Message, Payload, RamsesError, Verb};

use crate::config::BindingConfig;
use crate::dispatcher::DispatchEvent;
use crate::error::{Result, RfError};
use crate::gateway::GatewayHandle;
use crate::schema::BindingRecord;

/// Handshake state of a supplicant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    Idle,
    OfferReceived,
    AcceptSent,
    ConfirmReceived,
    Bound,
    TimedOut,
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingState::Idle => write!(f, "idle"),
            BindingState::OfferReceived => write!(f, "offer received"),
            BindingState::AcceptSent => write!(f, "accept sent"),
            BindingState::ConfirmReceived => write!(f, "confirm received"),
            BindingState::Bound => write!(f, "bound"),
            BindingState::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Progress of a handshake
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BindingEvent {
    /// An attempt moved to a new state
    StateChanged {
        supplicant: Address,
        respondent: Option<Address>,
        state: BindingState,
        /// Tuples of the phase that caused the change
        tuples: Vec<BindTuple>,
    },
    /// The handshake completed
    Bound(BindingRecord),
    /// No reply within the phase's window; nothing was recorded
    TimedOut {
        supplicant: Address,
        /// Phase that was awaited
        awaiting: BindPhase,
    },
}

impl BindingEvent {
    /// The timeout as a transport error
    pub fn to_error(&self) -> Option<RamsesError> {
        match self {
            BindingEvent::TimedOut {
                supplicant,
                awaiting,
            } => Some(RamsesError::BindingTimeout {
                supplicant: supplicant.to_string(),
                phase: awaiting.to_string(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Attempt {
    state: BindingState,
    offered: Vec<BindTuple>,
    offered_at: NaiveDateTime,
    respondent: Option<Address>,
    accepted: Vec<BindTuple>,
    accepted_at: Option<NaiveDateTime>,
    deadline: NaiveDateTime,
}

impl Attempt {
    fn awaiting(&self) -> BindPhase {
        match self.state {
            BindingState::OfferReceived => BindPhase::Accept,
            _ => BindPhase::Confirm,
        }
    }
}

/// Tracks binding handshakes heard on the air
#[derive(Debug, Clone)]
pub struct BindingTracker {
    config: BindingConfig,
    attempts: BTreeMap<Address, Attempt>,
    /// Completed bindings per supplicant, with the time of the confirm
    completed: BTreeMap<Address, (BindingRecord, NaiveDateTime)>,
    timed_out: BTreeMap<Address, NaiveDateTime>,
}

impl BindingTracker {
    pub fn new(config: BindingConfig) -> Self {
        Self {
            config,
            attempts: BTreeMap::new(),
            completed: BTreeMap::new(),
            timed_out: BTreeMap::new(),
        }
    }

    /// Current state for a supplicant
    pub fn state(&self, supplicant: Address) -> BindingState {
        if let Some(attempt) = self.attempts.get(&supplicant) {
            return attempt.state;
        }
        // an abandoned attempt leaves an earlier binding in place
        if self.completed.contains_key(&supplicant) {
            BindingState::Bound
        } else if self.timed_out.contains_key(&supplicant) {
            BindingState::TimedOut
        } else {
            BindingState::Idle
        }
    }

    /// Last binding completed by a supplicant
    pub fn record(&self, supplicant: Address) -> Option<&BindingRecord> {
        self.completed.get(&supplicant).map(|(record, _)| record)
    }

    /// Attempts still in progress
    pub fn in_progress(&self) -> usize {
        self.attempts.len()
    }

    /// Feed a decoded message; anything but `1FC9` is ignored
    pub fn on_message(&mut self, msg: &Message) -> Vec<BindingEvent> {
        if msg.code != Code::RF_BIND {
            return Vec::new();
        }
        let Payload::RfBind(bind) = &msg.payload else {
            return Vec::new();
        };
        let mut events = self.expire(msg.dtm);
        match bind.phase {
            Some(BindPhase::Offer) => events.extend(self.on_offer(msg, bind)),
            Some(BindPhase::Accept) => events.extend(self.on_accept(msg, bind)),
            Some(BindPhase::Confirm) => events.extend(self.on_confirm(msg)),
            None => {}
        }
        events
    }

    /// True if `dtm` is no later than the confirm that completed `supplicant`'s binding
    fn is_replay(&self, supplicant: Address, dtm: NaiveDateTime) -> bool {
        self.completed
            .get(&supplicant)
            .is_some_and(|(_, bound_at)| dtm <= *bound_at)
    }

    fn on_offer(&mut self, msg: &Message, bind: &RfBind) -> Option<BindingEvent> {
        let supplicant = msg.src;
        if self.is_replay(supplicant, msg.dtm) {
            trace!(%supplicant, "Offer replayed after binding; ignored");
            return None;
        }
        if let Some(attempt) = self.attempts.get(&supplicant) {
            if attempt.offered_at == msg.dtm && attempt.offered == bind.bindings {
                return None;
            }
            debug!(%supplicant, state = %attempt.state, "Binding attempt restarted by new offer");
        }
        info!(%supplicant, tuples = bind.bindings.len(), "Bind offer");
        self.timed_out.remove(&supplicant);
        self.attempts.insert(
            supplicant,
            Attempt {
                state: BindingState::OfferReceived,
                offered: bind.bindings.clone(),
                offered_at: msg.dtm,
                respondent: None,
                accepted: Vec::new(),
                accepted_at: None,
                deadline: msg.dtm + self.window(self.config.accept_timeout),
            },
        );
        Some(BindingEvent::StateChanged {
            supplicant,
            respondent: None,
            state: BindingState::OfferReceived,
            tuples: bind.bindings.clone(),
        })
    }

    fn on_accept(&mut self, msg: &Message, bind: &RfBind) -> Option<BindingEvent> {
        let supplicant = msg.dst?;
        let respondent = msg.src;
        let window = self.window(self.config.confirm_timeout);
        let attempt = self.attempts.get_mut(&supplicant)?;
        match attempt.state {
            BindingState::OfferReceived if msg.dtm >= attempt.offered_at => {}
            BindingState::AcceptSent
                if attempt.respondent == Some(respondent) && attempt.accepted_at == Some(msg.dtm) =>
            {
                return None;
            }
            state => {
                trace!(%supplicant, %respondent, %state, "Accept out of sequence; ignored");
                return None;
            }
        }
        info!(%supplicant, %respondent, tuples = bind.bindings.len(), "Bind accept");
        attempt.state = BindingState::AcceptSent;
        attempt.respondent = Some(respondent);
        attempt.accepted = bind.bindings.clone();
        attempt.accepted_at = Some(msg.dtm);
        attempt.deadline = msg.dtm + window;
        Some(BindingEvent::StateChanged {
            supplicant,
            respondent: Some(respondent),
            state: BindingState::AcceptSent,
            tuples: bind.bindings.clone(),
        })
    }

    fn on_confirm(&mut self, msg: &Message) -> Vec<BindingEvent> {
        let supplicant = msg.src;
        let Some(attempt) = self.attempts.get(&supplicant) else {
            return Vec::new();
        };
        let respondent = match attempt.respondent {
            Some(respondent)
                if attempt.state == BindingState::AcceptSent && msg.dst == Some(respondent) =>
            {
                respondent
            }
            _ => {
                trace!(%supplicant, state = %attempt.state, "Confirm out of sequence; ignored");
                return Vec::new();
            }
        };
        let Some(attempt) = self.attempts.remove(&supplicant) else {
            return Vec::new();
        };
        let record = BindingRecord {
            supplicant,
            respondent,
            offered: attempt.offered,
            accepted: attempt.accepted,
        };
        info!(%supplicant, %respondent, "Bound");
        self.completed.insert(supplicant, (record.clone(), msg.dtm));
        vec![
            BindingEvent::StateChanged {
                supplicant,
                respondent: Some(respondent),
                state: BindingState::ConfirmReceived,
                tuples: Vec::new(),
            },
            BindingEvent::Bound(record),
        ]
    }

    /// Abandon attempts whose window closed before `now`
    pub fn expire(&mut self, now: NaiveDateTime) -> Vec<BindingEvent> {
        let expired: Vec<Address> = self
            .attempts
            .iter()
            .filter(|(_, attempt)| attempt.deadline < now)
            .map(|(supplicant, _)| *supplicant)
            .collect();
        expired
            .into_iter()
            .filter_map(|supplicant| {
                let attempt = self.attempts.remove(&supplicant)?;
                warn!(%supplicant, awaiting = %attempt.awaiting(), "Binding timed out");
                self.timed_out.insert(supplicant, attempt.deadline);
                Some(BindingEvent::TimedOut {
                    supplicant,
                    awaiting: attempt.awaiting(),
                })
            })
            .collect()
    }

    /// Earliest deadline of an attempt in progress
    pub fn next_expiry(&self) -> Option<NaiveDateTime> {
        self.attempts.values().map(|attempt| attempt.deadline).min()
    }

    fn window(&self, timeout: std::time::Duration) -> chrono::Duration {
        chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365))
    }
}

// ===== Gateway as a party =====

/// Wait up to `within` for the first event `pick` accepts
async fn wait_for<T>(
    events: &mut broadcast::Receiver<DispatchEvent>,
    within: Duration,
    mut pick: impl FnMut(&DispatchEvent) -> Option<T>,
) -> Result<Option<T>> {
    let waiting = async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(&event) {
                        return Ok(found);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Binding waiter lagged behind events");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(RfError::GatewayStopped),
            }
        }
    };
    match tokio::time::timeout(within, waiting).await {
        Ok(found) => found.map(Some),
        Err(_) => Ok(None),
    }
}

fn bound_record(event: &DispatchEvent, supplicant: Address) -> Option<BindingRecord> {
    match event {
        DispatchEvent::Binding(BindingEvent::Bound(record)) if record.supplicant == supplicant => {
            Some(record.clone())
        }
        _ => None,
    }
}

fn bind_timeout(supplicant: impl ToString, phase: BindPhase) -> RfError {
    RamsesError::BindingTimeout {
        supplicant: supplicant.to_string(),
        phase: phase.to_string(),
    }
    .into()
}

impl GatewayHandle {
    /// Bind the gateway to a respondent, offering `codes` in `domain`
    ///
    /// The offer is repeated until a respondent accepts it or the retries
    /// run out; the confirm then completes the handshake.
    ///
    /// Frames go out under [`gateway_id`](Self::gateway_id) as it stands,
    /// but the handshake is followed under whatever address the gateway's
    /// echo reports, since that is where the respondent sends its accept.
    pub async fn bind_as_supplicant(&self, codes: &[Code], domain: HexByte) -> Result<BindingRecord> {
        let sender = self.gateway_id();
        let tuples: Vec<BindTuple> = codes
            .iter()
            .map(|code| BindTuple(domain, *code, sender))
            .collect();
        let mut events = self.subscribe();

        let mut respondent = None;
        for attempt in 0..=self.binding.offer_retries {
            debug!(attempt, "Sending bind offer");
            self.send_command(Command::put_bind(Verb::I, sender, sender, tuples.clone()))
                .await?;
            respondent = wait_for(&mut events, self.binding.accept_timeout, |event| match event {
                DispatchEvent::Binding(BindingEvent::StateChanged {
                    supplicant,
                    respondent: Some(respondent),
                    state: BindingState::AcceptSent,
                    ..
                }) if *supplicant == self.gateway_id() => Some(*respondent),
                _ => None,
            })
            .await?;
            if respondent.is_some() {
                break;
            }
        }
        let respondent =
            respondent.ok_or_else(|| bind_timeout(self.gateway_id(), BindPhase::Accept))?;

        self.send_command(Command::put_bind(Verb::I, sender, respondent, Vec::new()))
            .await?;
        wait_for(&mut events, self.binding.confirm_timeout, |event| {
            bound_record(event, self.gateway_id())
        })
        .await?
        .ok_or_else(|| bind_timeout(self.gateway_id(), BindPhase::Confirm))
    }

    /// Accept the next bind offer heard within `listen`, answering with `codes` in `domain`
    pub async fn bind_as_respondent(
        &self,
        codes: &[Code],
        domain: HexByte,
        listen: Duration,
    ) -> Result<BindingRecord> {
        let mut events = self.subscribe();

        let supplicant = wait_for(&mut events, listen, |event| match event {
            DispatchEvent::Binding(BindingEvent::StateChanged {
                supplicant,
                state: BindingState::OfferReceived,
                ..
            }) if *supplicant != self.gateway_id() => Some(*supplicant),
            _ => None,
        })
        .await?
        .ok_or_else(|| bind_timeout("any", BindPhase::Offer))?;
        info!(%supplicant, "Accepting bind offer");

        let me = self.gateway_id();
        let tuples = codes.iter().map(|code| BindTuple(domain, *code, me)).collect();
        // the accept is answered by the confirm, not a reply; keep it queued until bound
        let _accept = self
            .submit(Command::put_bind(Verb::W, me, supplicant, tuples).with_retries(0))
            .await?;
        let record = wait_for(
            &mut events,
            self.binding.accept_timeout + self.binding.confirm_timeout,
            |event| bound_record(event, supplicant),
        )
        .await?
        .ok_or_else(|| bind_timeout(supplicant, BindPhase::Confirm))?;
        if record.respondent != self.gateway_id() {
            return Err(RfError::unexpected(
                format!("W {supplicant} 1FC9"),
                format!("bound to {} instead", record.respondent),
            ));
        }
        Ok(record)
    }
}
