use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use jobhub_types::events::EventKey;

pub const DEFAULT_DEDUP_CAPACITY: usize = 512;
pub const DEFAULT_BUSY_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub enum DedupPolicy {
    /// Suppress events whose key was already processed. Remembers the last
    /// `capacity` keys.
    Idempotent { capacity: usize },
    /// Suppress an event equal to the last admitted one, or any event arriving
    /// within the window after the last admitted one. Drops distinct events in
    /// bursts; only for surfaces that want throttling.
    BusyWindow(Duration),
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self::Idempotent {
            capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}

/// Decides whether a pushed event should be processed.
#[derive(Debug)]
pub struct DuplicateGuard {
    policy: DedupPolicy,
    seen: HashSet<EventKey>,
    order: VecDeque<EventKey>,
    last: Option<EventKey>,
    busy_until: Option<Instant>,
}

impl DuplicateGuard {
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            policy,
            seen: HashSet::new(),
            order: VecDeque::new(),
            last: None,
            busy_until: None,
        }
    }

    /// Returns true if the event should be processed, and records it.
    pub fn admit(&mut self, key: &EventKey) -> bool {
        match self.policy {
            DedupPolicy::Idempotent { capacity } => {
                if self.seen.contains(key) {
                    return false;
                }
                self.seen.insert(key.clone());
                self.order.push_back(key.clone());
                while self.order.len() > capacity.max(1) {
                    if let Some(evicted) = self.order.pop_front() {
                        self.seen.remove(&evicted);
                    }
                }
                true
            }
            DedupPolicy::BusyWindow(window) => {
                let now = Instant::now();
                if self.last.as_ref() == Some(key) {
                    return false;
                }
                if self.busy_until.is_some_and(|until| now < until) {
                    return false;
                }
                self.last = Some(key.clone());
                self.busy_until = Some(now + window);
                true
            }
        }
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
        self.last = None;
        self.busy_until = None;
    }
}
