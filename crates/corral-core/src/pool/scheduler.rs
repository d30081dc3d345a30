//! Round-robin worker selection.

use std::time::{Duration, Instant};

/// Round-robin cursor over the worker slots.
///
/// Selection scans at most one full cycle starting at the cursor and leaves
/// the cursor just past the chosen slot, so consecutive picks spread over all
/// eligible workers.
#[derive(Debug, Default)]
pub struct Scheduler {
    round_id: usize,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot the next scan starts from.
    pub fn round_id(&self) -> usize {
        self.round_id
    }

    /// Pick the first slot from the cursor for which `eligible` holds.
    pub fn select<T>(&mut self, items: &[T], eligible: impl Fn(&T) -> bool) -> Option<usize> {
        let len = items.len();
        if len == 0 {
            return None;
        }
        let start = self.round_id % len;
        for offset in 0..len {
            let slot = (start + offset) % len;
            if eligible(&items[slot]) {
                self.round_id = (slot + 1) % len;
                return Some(slot);
            }
        }
        None
    }
}

/// Counts events and lets at most one through per interval.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last: Option<Instant>,
    total: u64,
    reported: u64,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            total: 0,
            reported: 0,
        }
    }

    /// Record an event; true if it should be reported.
    pub fn hit(&mut self, now: Instant) -> bool {
        self.total += 1;
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                self.reported += 1;
                true
            }
        }
    }

    /// Events recorded so far, reported or not.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Events that were let through.
    pub fn reported(&self) -> u64 {
        self.reported
    }
}
