//! Fragment reassembly
//!
//! Payloads that span several packets arrive as [`FragmentPart`]s. Parts are
//! grouped by `(src, dst, code)` and kept until their set resolves:
//!
//! - a counted set (e.g. schedules) completes once it holds as many distinct
//!   parts as it declares; a part declaring a different count replaces the set,
//!   and the old one expires;
//! - an array completes once it holds both its first part and a short (final)
//!   part; a second first part, or a repeated index, starts a new array and
//!   proves the old one complete;
//! - any set still pending one window after its first part expires and is
//!   released as a best-effort partial.
//!
//! Parts are merged in index order, so arrival order within the window does
//! not change the result. Time is packet time, so replaying a log behaves the
//! same as live traffic.

use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, trace};

use crate::address::Address;
use crate::codec::{FragmentPart, Payload};
use crate::config::FragmentConfig;
use crate::packet::{Code, Packet};

/// Parts belong together when they share source, destination and code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub src: Address,
    pub dst: Option<Address>,
    pub code: Code,
}

impl FragmentKey {
    /// Key of a packet
    pub fn of(pkt: &Packet) -> Self {
        Self {
            src: pkt.src(),
            dst: pkt.dst(),
            code: pkt.code(),
        }
    }
}

/// How a fragment set was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentStatus {
    /// Every part arrived
    Complete,
    /// The window elapsed (or the set was superseded) first
    Expired,
}

/// A resolved fragment set
#[derive(Debug, Clone)]
pub struct ResolvedSet {
    pub key: FragmentKey,
    pub status: FragmentStatus,
    /// Part payloads in index order
    pub parts: Vec<Payload>,
    /// Most recent packet of the set
    pub packet: Packet,
}

#[derive(Debug)]
struct PendingSet {
    parts: BTreeMap<u8, Payload>,
    total: Option<u8>,
    has_first: bool,
    has_final: bool,
    started: NaiveDateTime,
    packet: Packet,
}

impl PendingSet {
    fn new(pkt: &Packet, total: Option<u8>) -> Self {
        Self {
            parts: BTreeMap::new(),
            total,
            has_first: false,
            has_final: false,
            started: pkt.dtm(),
            packet: pkt.clone(),
        }
    }

    fn insert(&mut self, pkt: &Packet, part: FragmentPart) {
        self.has_first |= part.is_first;
        self.has_final |= part.is_final;
        self.parts.insert(part.index, part.payload);
        self.packet = pkt.clone();
    }

    fn is_complete(&self) -> bool {
        match self.total {
            Some(total) => self.parts.len() >= usize::from(total),
            None => self.has_first && self.has_final,
        }
    }

    /// Whether `part` cannot belong to this set
    fn superseded_by(&self, part: &FragmentPart) -> Option<FragmentStatus> {
        match self.total {
            Some(total) if part.total != Some(total) => Some(FragmentStatus::Expired),
            Some(_) => None,
            None if self.parts.contains_key(&part.index) || (part.is_first && self.has_first) => {
                Some(FragmentStatus::Complete)
            }
            None => None,
        }
    }

    fn resolve(self, key: FragmentKey, status: FragmentStatus) -> ResolvedSet {
        ResolvedSet {
            key,
            status,
            parts: self.parts.into_values().collect(),
            packet: self.packet,
        }
    }
}

/// Buffer of pending fragment sets
#[derive(Debug)]
pub struct FragmentBuffer {
    window: chrono::Duration,
    sets: HashMap<FragmentKey, PendingSet>,
}

impl FragmentBuffer {
    /// Create a buffer with the given reassembly window
    pub fn new(window: Duration) -> Self {
        Self {
            window: chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(365)),
            sets: HashMap::new(),
        }
    }

    /// Create from configuration
    pub fn from_config(config: &FragmentConfig) -> Self {
        Self::new(config.window)
    }

    /// Add a part, returning any sets it resolves (superseded sets first)
    ///
    /// Does not expire other sets; call [`expire`](Self::expire) first.
    pub fn push(&mut self, pkt: &Packet, part: FragmentPart) -> Vec<ResolvedSet> {
        let key = FragmentKey::of(pkt);
        let mut resolved = Vec::new();

        if let Some(status) = self.sets.get(&key).and_then(|set| set.superseded_by(&part)) {
            if let Some(old) = self.sets.remove(&key) {
                debug!(code = %key.code, src = %key.src, parts = old.parts.len(), ?status, "Fragment set superseded");
                resolved.push(old.resolve(key, status));
            }
        }

        trace!(code = %key.code, src = %key.src, index = part.index, "Buffering fragment");
        let set = self
            .sets
            .entry(key)
            .or_insert_with(|| PendingSet::new(pkt, part.total));
        set.insert(pkt, part);

        if set.is_complete() {
            if let Some(set) = self.sets.remove(&key) {
                resolved.push(set.resolve(key, FragmentStatus::Complete));
            }
        }
        resolved
    }

    /// Release every set whose window has elapsed by `now`
    pub fn expire(&mut self, now: NaiveDateTime) -> Vec<ResolvedSet> {
        let expired: Vec<FragmentKey> = self
            .sets
            .iter()
            .filter(|(_, set)| now - set.started > self.window)
            .map(|(key, _)| *key)
            .collect();

        let mut resolved: Vec<ResolvedSet> = expired
            .into_iter()
            .filter_map(|key| {
                self.sets.remove(&key).map(|set| {
                    debug!(code = %key.code, src = %key.src, parts = set.parts.len(), "Fragment set expired");
                    set.resolve(key, FragmentStatus::Expired)
                })
            })
            .collect();
        resolved.sort_by_key(|r| r.packet.dtm());
        resolved
    }

    /// Earliest time a pending set will expire
    pub fn next_expiry(&self) -> Option<NaiveDateTime> {
        self.sets.values().map(|set| set.started + self.window).min()
    }

    /// True while a set is pending for `key`
    pub fn contains(&self, key: &FragmentKey) -> bool {
        self.sets.contains_key(key)
    }

    /// Number of pending sets
    pub fn pending(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

impl Default for FragmentBuffer {
    fn default() -> Self {
        Self::from_config(&FragmentConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Opaque;
    use crate::packet::parse_line;
    use chrono::NaiveDate;

    fn at(secs: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, secs)
            .unwrap()
    }

    fn packet(secs: u32) -> Packet {
        parse_line(" I --- 01:145038 --:------ 01:145038 000A 006 001001F40DAC", at(secs))
            .unwrap()
            .unwrap()
    }

    fn part(index: u8, total: Option<u8>, is_first: bool, is_final: bool) -> FragmentPart {
        FragmentPart {
            index,
            total,
            is_first,
            is_final,
            payload: Payload::Opaque(Opaque {
                payload: vec![index],
            }),
        }
    }

    fn indices(set: &ResolvedSet) -> Vec<u8> {
        set.parts
            .iter()
            .map(|p| match p {
                Payload::Opaque(o) => o.payload[0],
                _ => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn test_short_array_completes_alone() {
        let mut buffer = FragmentBuffer::default();
        let resolved = buffer.push(&packet(0), part(0, None, true, true));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].status, FragmentStatus::Complete);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_array_order_independent() {
        let mut forward = FragmentBuffer::default();
        assert!(forward.push(&packet(0), part(0, None, true, false)).is_empty());
        let a = forward.push(&packet(1), part(8, None, false, true));

        let mut reverse = FragmentBuffer::default();
        assert!(reverse.push(&packet(0), part(8, None, false, true)).is_empty());
        let b = reverse.push(&packet(1), part(0, None, true, false));

        assert_eq!(indices(&a[0]), vec![0, 8]);
        assert_eq!(indices(&a[0]), indices(&b[0]));
        assert_eq!(a[0].status, FragmentStatus::Complete);
        assert_eq!(b[0].status, FragmentStatus::Complete);
    }

    #[test]
    fn test_restart_proves_previous_complete() {
        let mut buffer = FragmentBuffer::default();
        assert!(buffer.push(&packet(0), part(0, None, true, false)).is_empty());
        let resolved = buffer.push(&packet(30), part(0, None, true, false));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].status, FragmentStatus::Complete);
        assert_eq!(buffer.pending(), 1);
    }

    #[test]
    fn test_counted_set() {
        let mut buffer = FragmentBuffer::default();
        assert!(buffer.push(&packet(0), part(2, Some(3), false, false)).is_empty());
        assert!(buffer.push(&packet(0), part(1, Some(3), true, false)).is_empty());
        // a repeated part does not count twice
        assert!(buffer.push(&packet(1), part(1, Some(3), true, false)).is_empty());
        let resolved = buffer.push(&packet(1), part(3, Some(3), false, true));
        assert_eq!(resolved.len(), 1);
        assert_eq!(indices(&resolved[0]), vec![1, 2, 3]);
    }

    #[test]
    fn test_changed_total_expires_old_set() {
        let mut buffer = FragmentBuffer::default();
        buffer.push(&packet(0), part(1, Some(3), true, false));
        let resolved = buffer.push(&packet(1), part(1, Some(2), true, false));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].status, FragmentStatus::Expired);
        assert_eq!(buffer.pending(), 1);
    }

    #[test]
    fn test_window_expiry() {
        let mut buffer = FragmentBuffer::new(Duration::from_secs(3));
        buffer.push(&packet(0), part(0, None, true, false));
        assert!(buffer.expire(at(3)).is_empty());
        assert_eq!(buffer.next_expiry(), Some(at(3)));
        let resolved = buffer.expire(at(4));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].status, FragmentStatus::Expired);
        assert!(buffer.is_empty());
    }
}
