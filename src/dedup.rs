use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::packet::MacKey;

/// Per-MAC cooldown gate: at most one packet per key is accepted within any
/// rolling window measured from the previous acceptance.
pub struct DedupCache {
    window: Duration,
    entries: DashMap<MacKey, Instant>,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: DashMap::new(),
        }
    }

    /// Check-then-update in one step. Returns true when the key is outside
    /// its cooldown window and the timestamp was advanced. The entry lock is
    /// held across the check, so two concurrent duplicates cannot both pass.
    pub fn accept(&self, key: MacKey) -> bool {
        self.accept_at(key, Instant::now())
    }

    /// A packet is a duplicate while no more than one full window has
    /// elapsed since the last acceptance.
    fn accept_at(&self, key: MacKey, now: Instant) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let elapsed = now.saturating_duration_since(*occupied.get());
                if elapsed <= self.window {
                    false
                } else {
                    occupied.insert(now);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        }
    }

    /// Remove entries whose cooldown has already lapsed. Returns how many
    /// were evicted.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let window = self.window;
        let before = self.entries.len();
        self.entries
            .retain(|_, accepted| now.saturating_duration_since(*accepted) <= window);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
