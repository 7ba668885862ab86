//! Consecutive failure counting for the metrics circuit breaker.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
struct FailureEntry {
    count: u32,
    expires_at: Instant,
}

/// Per-target consecutive failure counter.
///
/// Counters expire after `ttl` without a new failure, so a target that fails
/// occasionally never accumulates toward the threshold. Counters are
/// process-local.
#[derive(Debug)]
pub struct FailureTracker {
    entries: DashMap<String, FailureEntry>,
    threshold: u32,
    ttl: Duration,
}

impl FailureTracker {
    pub fn new(threshold: u32, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            threshold: threshold.max(1),
            ttl,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Count one more failure and return the new consecutive count.
    pub fn record_failure(&self, target_id: &str) -> u32 {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(target_id.to_string())
            .or_insert(FailureEntry {
                count: 0,
                expires_at: now + self.ttl,
            });

        if entry.expires_at <= now {
            entry.count = 0;
        }
        entry.count = entry.count.saturating_add(1);
        entry.expires_at = now + self.ttl;
        entry.count
    }

    pub fn reset(&self, target_id: &str) {
        self.entries.remove(target_id);
    }

    /// Current consecutive count, zero once expired.
    pub fn count(&self, target_id: &str) -> u32 {
        match self.entries.get(target_id) {
            Some(entry) if entry.expires_at > Instant::now() => entry.count,
            _ => 0,
        }
    }

    pub fn should_trip(&self, count: u32) -> bool {
        count >= self.threshold
    }
}
