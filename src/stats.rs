//! Per-handler statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-handler counters
pub struct HandlerStats {
    pub events_received: AtomicU64,
    pub duplicate_events: AtomicU64,
    pub events_handled: AtomicU64,
    pub retries: AtomicU64,
    pub failures: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub alerts: AtomicU64,
}

impl HandlerStats {
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            duplicate_events: AtomicU64::new(0),
            events_handled: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            alerts: AtomicU64::new(0),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HandlerStatsSnapshot {
        HandlerStatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            duplicate_events: self.duplicate_events.load(Ordering::Relaxed),
            events_handled: self.events_handled.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            alerts: self.alerts.load(Ordering::Relaxed),
        }
    }
}

impl Default for HandlerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandlerStatsSnapshot {
    pub events_received: u64,
    pub duplicate_events: u64,
    pub events_handled: u64,
    pub retries: u64,
    pub failures: u64,
    pub dead_lettered: u64,
    pub alerts: u64,
}
