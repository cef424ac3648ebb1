//! Message dispatch: one line in, decoded messages and entity changes out
//!
//! The [`Dispatcher`] is the single owner of the fragment buffer, the
//! duplicate filter, the [`EntityGraph`] and the [`BindingTracker`]. Each
//! line is framed, filtered, decoded and applied before the next one is
//! looked at. Nothing a line contains can stop the dispatcher: framing and
//! codec failures come out as [`DispatchEvent::Failed`].

use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use ramses_tx::{parse_line, Decoding, DuplicateFilter, Message, MessageDecoder, Packet, Registry};

use crate::binding::{BindingEvent, BindingTracker};
use crate::config::GatewayConfig;
use crate::graph::{EntityGraph, GraphEvent};
use crate::schema::SchemaSnapshot;

/// Stage at which an input was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The line is not a well-formed packet
    Framing,
    /// The packet's payload could not be decoded
    Codec,
}

/// Output of the dispatcher, plus the raw lines the gateway reads
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// A line as read from the interface, before framing
    Line { raw: String },
    /// A decoded message (fragment parts included)
    Message { message: Message },
    /// A dropped input, with its raw text
    Failed {
        raw: String,
        kind: FailureKind,
        /// Field (framing) or code (codec) that failed
        context: String,
        error: String,
    },
    /// A change to the entity graph
    Graph(GraphEvent),
    /// Progress of a binding handshake
    Binding(BindingEvent),
}

/// Dispatch counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Lines seen
    pub lines: u64,
    /// Messages delivered
    pub messages: u64,
    /// Lines dropped by framing
    pub framing_errors: u64,
    /// Packets dropped by their codec
    pub codec_errors: u64,
    /// Frames dropped as duplicates
    pub duplicates: u64,
}

/// Decode and apply incoming traffic
#[derive(Debug)]
pub struct Dispatcher {
    decoder: MessageDecoder,
    dedup: DuplicateFilter,
    graph: EntityGraph,
    binding: BindingTracker,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(config: &GatewayConfig, registry: Arc<Registry>) -> Self {
        Self {
            decoder: MessageDecoder::new(registry, &config.ramses.fragments),
            dedup: DuplicateFilter::from_config(&config.ramses.transport),
            graph: EntityGraph::new(config.graph.clone()),
            binding: BindingTracker::new(config.binding.clone()),
            stats: DispatchStats::default(),
        }
    }

    pub fn graph(&self) -> &EntityGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut EntityGraph {
        &mut self.graph
    }

    pub fn binding(&self) -> &BindingTracker {
        &self.binding
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Seed the graph from a snapshot
    pub fn load_snapshot(&mut self, snapshot: &SchemaSnapshot) {
        self.graph.load_snapshot(snapshot);
    }

    /// Process one line reported by the gateway
    ///
    /// `received` stamps lines that carry no timestamp of their own.
    pub fn process_line(&mut self, line: &str, received: NaiveDateTime) -> Vec<DispatchEvent> {
        self.stats.lines += 1;
        match parse_line(line, received) {
            Ok(Some(pkt)) => self.process_packet(pkt),
            Ok(None) => Vec::new(),
            Err(error) => {
                self.stats.framing_errors += 1;
                warn!(line = line.trim_end(), field = error.field(), %error, "Line dropped");
                vec![DispatchEvent::Failed {
                    raw: line.trim_end().to_string(),
                    kind: FailureKind::Framing,
                    context: error.field().to_string(),
                    error: error.to_string(),
                }]
            }
        }
    }

    /// Process a framed packet
    pub fn process_packet(&mut self, pkt: Packet) -> Vec<DispatchEvent> {
        if self.dedup.is_duplicate(&pkt) {
            self.stats.duplicates += 1;
            return Vec::new();
        }
        let mut events = self.expire_bindings(pkt.dtm());
        for decoding in self.decoder.decode_packet(pkt) {
            events.extend(self.process_decoding(decoding));
        }
        events
    }

    /// Release fragment sets and binding attempts whose window closed before `now`
    pub fn expire(&mut self, now: NaiveDateTime) -> Vec<DispatchEvent> {
        let mut events = Vec::new();
        for decoding in self.decoder.expire(now) {
            events.extend(self.process_decoding(decoding));
        }
        events.extend(self.expire_bindings(now));
        events
    }

    /// Earliest time [`expire`](Self::expire) has work to do
    pub fn next_expiry(&self) -> Option<NaiveDateTime> {
        match (self.decoder.next_expiry(), self.binding.next_expiry()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn expire_bindings(&mut self, now: NaiveDateTime) -> Vec<DispatchEvent> {
        self.binding
            .expire(now)
            .into_iter()
            .map(DispatchEvent::Binding)
            .collect()
    }

    fn process_decoding(&mut self, decoding: Decoding) -> Vec<DispatchEvent> {
        match decoding {
            Decoding::Message(msg) => self.process_message(msg),
            Decoding::Failed { packet, error } => {
                self.stats.codec_errors += 1;
                vec![DispatchEvent::Failed {
                    raw: packet.to_string(),
                    kind: FailureKind::Codec,
                    context: packet.code().to_string(),
                    error: error.to_string(),
                }]
            }
        }
    }

    fn process_message(&mut self, msg: Message) -> Vec<DispatchEvent> {
        self.stats.messages += 1;
        let mut events = Vec::new();

        for change in self.graph.apply(&msg) {
            events.push(DispatchEvent::Graph(change));
        }
        for progress in self.binding.on_message(&msg) {
            if let BindingEvent::Bound(record) = &progress {
                for change in self.graph.record_binding(record.clone(), msg.dtm) {
                    events.push(DispatchEvent::Graph(change));
                }
            }
            events.push(DispatchEvent::Binding(progress));
        }
        debug!(msg = %msg, changes = events.len(), "Dispatched");
        events.insert(0, DispatchEvent::Message { message: msg });
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn received() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(&GatewayConfig::default(), Arc::new(Registry::new()))
    }

    #[test]
    fn test_message_then_changes() {
        let mut dispatcher = dispatcher();
        let events = dispatcher.process_line(
            " I --- 01:145038 --:------ 01:145038 30C9 003 0107C1",
            received(),
        );
        assert!(matches!(events[0], DispatchEvent::Message { .. }));
        assert!(events
            .iter()
            .any(|e| matches!(e, DispatchEvent::Graph(GraphEvent::StateChanged { .. }))));
        assert_eq!(dispatcher.stats().messages, 1);
    }

    #[test]
    fn test_codec_failure_is_reported() {
        let mut dispatcher = dispatcher();
        let events = dispatcher.process_line(
            " I --- 01:145038 --:------ 01:145038 30C9 002 0107",
            received(),
        );
        assert!(matches!(
            &events[..],
            [DispatchEvent::Failed { kind: FailureKind::Codec, context, .. }] if context == "30C9"
        ));
        assert_eq!(dispatcher.stats().codec_errors, 1);
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let mut dispatcher = dispatcher();
        assert!(dispatcher.process_line("", received()).is_empty());
        assert!(dispatcher.process_line("# comment", received()).is_empty());
        assert_eq!(dispatcher.stats().framing_errors, 0);
    }

    #[test]
    fn test_duplicates_are_dropped_when_enabled() {
        let mut config = GatewayConfig::default();
        config.ramses.transport.dedup_window = std::time::Duration::from_secs(1);
        let mut dispatcher = Dispatcher::new(&config, Arc::new(Registry::new()));
        let line = " I --- 01:145038 --:------ 01:145038 30C9 003 0107C1";
        assert!(!dispatcher.process_line(line, received()).is_empty());
        assert!(dispatcher.process_line(line, received()).is_empty());
        assert_eq!(dispatcher.stats().duplicates, 1);
    }
}
