//! Duplicate frame suppression
//!
//! Some installations hear the same transmission twice (e.g. via a repeater,
//! or a second gateway on the same serial bus). The [`DuplicateFilter`] drops
//! a frame identical to one seen within a short window. Time is packet time.

use chrono::NaiveDateTime;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::TransportConfig;
use crate::packet::Packet;

#[derive(Debug, Clone, Copy)]
struct SeenFrame {
    last_seen: NaiveDateTime,
    seen_count: u32,
}

/// Filter statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterStats {
    /// Frames checked
    pub total_checks: u64,
    /// Frames dropped as duplicates
    pub duplicates_dropped: u64,
    /// Entries evicted to make room
    pub lru_evictions: u64,
}

impl FilterStats {
    /// Fraction of checked frames that were duplicates
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.duplicates_dropped as f64 / self.total_checks as f64
        }
    }
}

/// LRU cache of recently seen frames
#[derive(Debug)]
pub struct DuplicateFilter {
    cache: LruCache<String, SeenFrame>,
    window: chrono::Duration,
    stats: FilterStats,
}

impl DuplicateFilter {
    /// Create a filter; a zero window disables it
    pub fn new(capacity: usize, window: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            window: chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero()),
            stats: FilterStats::default(),
        }
    }

    /// Create from transport configuration
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.dedup_cache_size, config.dedup_window)
    }

    pub fn is_enabled(&self) -> bool {
        self.window > chrono::Duration::zero()
    }

    /// Check a packet, recording it; returns `true` for a duplicate
    ///
    /// Frames are compared without their timestamp and signal strength.
    pub fn is_duplicate(&mut self, pkt: &Packet) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.stats.total_checks += 1;
        let frame = pkt.frame();
        let now = pkt.dtm();

        if let Some(seen) = self.cache.get_mut(&frame) {
            let fresh = now >= seen.last_seen && now - seen.last_seen <= self.window;
            seen.last_seen = now;
            if fresh {
                seen.seen_count += 1;
                self.stats.duplicates_dropped += 1;
                debug!(frame = %frame, seen_count = seen.seen_count, "Duplicate frame dropped");
                return true;
            }
            seen.seen_count = 1;
            return false;
        }

        if self.cache.len() >= self.cache.cap().get() {
            self.stats.lru_evictions += 1;
        }
        trace!(frame = %frame, "New frame recorded");
        self.cache.put(
            frame,
            SeenFrame {
                last_seen: now,
                seen_count: 1,
            },
        );
        false
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn stats(&self) -> &FilterStats {
        &self.stats
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl Default for DuplicateFilter {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}
