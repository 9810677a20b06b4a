//! Bounded in-process record of recently seen events

use std::collections::{HashSet, VecDeque};

use crate::EventId;

/// Seen-set of event ids with bounded retention.
///
/// Only a first-level filter: it is local to one process and forgets old
/// ids, so handlers still need a durable check for correctness.
pub struct RecentEvents {
    data: std::sync::Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    seen: HashSet<EventId>,
    order: VecDeque<EventId>,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: std::sync::Mutex::new(Inner {
                seen: HashSet::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`; returns `true` if it was not seen before
    pub fn check_and_mark(&self, id: EventId) -> bool {
        let Ok(mut data) = self.data.lock() else {
            // Treat a poisoned set as empty rather than dropping events
            return true;
        };
        if !data.seen.insert(id) {
            return false;
        }
        data.order.push_back(id);
        while data.order.len() > self.capacity {
            if let Some(old) = data.order.pop_front() {
                data.seen.remove(&old);
            }
        }
        true
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.data.lock().map(|d| d.seen.contains(&id)).unwrap_or(false)
    }

    /// Forget `id`, e.g. after its side effect failed and must be retried
    pub fn forget(&self, id: EventId) {
        if let Ok(mut data) = self.data.lock() {
            if data.seen.remove(&id) {
                data.order.retain(|e| *e != id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().map(|d| d.seen.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RecentEvents {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_and_mark() {
        let recent = RecentEvents::new(8);
        let id = EventId::new();
        assert!(recent.check_and_mark(id));
        assert!(!recent.check_and_mark(id));
        assert!(recent.contains(id));

        recent.forget(id);
        assert!(recent.check_and_mark(id));
    }

    #[test]
    fn test_evicts_oldest() {
        let recent = RecentEvents::new(2);
        let ids: Vec<EventId> = (0..3).map(|_| EventId::new()).collect();
        for id in &ids {
            recent.check_and_mark(*id);
        }
        assert_eq!(recent.len(), 2);
        assert!(!recent.contains(ids[0]));
        assert!(recent.contains(ids[2]));
    }
}
