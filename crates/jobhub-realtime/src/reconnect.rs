use std::fmt;
use std::time::Duration;

use rand::Rng;

/// Default delay between a failed subscription and the next attempt.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Connecting,
    Subscribed,
    Error,
    TimedOut,
    /// Explicit teardown. Terminal.
    Closed,
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Error => "error",
            Self::TimedOut => "timed_out",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// How long to wait before retry number `attempt` (1-based).
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    Fixed(Duration),
    /// `base * 2^(attempt-1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
    /// Uniform in `[0, exponential delay]`.
    Jittered { base: Duration, max: Duration },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Fixed(DEFAULT_RETRY_DELAY)
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { base, max } => exponential(*base, *max, attempt),
            Self::Jittered { base, max } => {
                let ceiling = exponential(*base, *max, attempt).as_millis() as u64;
                Duration::from_millis(rand::rng().random_range(0..=ceiling))
            }
        }
    }
}

fn exponential(base: Duration, max: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << shift).unwrap_or(max).min(max)
}

/// A scheduled retry. Only the most recently issued ticket can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryTicket {
    generation: u64,
    pub attempt: u32,
    pub delay: Duration,
}

/// Subscription state machine with a debounced retry schedule.
///
/// Error and TimedOut schedule a retry, superseding any retry still pending,
/// so there is never more than one outstanding. Subscribed clears the pending
/// retry and the attempt count. Closed is terminal.
#[derive(Debug)]
pub struct Reconnector {
    policy: BackoffPolicy,
    status: SubscriptionStatus,
    generation: u64,
    pending: Option<u64>,
    attempt: u32,
}

impl Reconnector {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            status: SubscriptionStatus::Connecting,
            generation: 0,
            pending: None,
            attempt: 0,
        }
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status
    }

    pub fn has_pending_retry(&self) -> bool {
        self.pending.is_some()
    }

    /// Records a status change. Returns the retry to schedule, if any.
    pub fn transition(&mut self, next: SubscriptionStatus) -> Option<RetryTicket> {
        if self.status == SubscriptionStatus::Closed {
            return None;
        }
        self.status = next;
        match next {
            SubscriptionStatus::Connecting => None,
            SubscriptionStatus::Subscribed => {
                self.pending = None;
                self.attempt = 0;
                None
            }
            SubscriptionStatus::Error | SubscriptionStatus::TimedOut => Some(self.reconnect()),
            SubscriptionStatus::Closed => {
                self.pending = None;
                None
            }
        }
    }

    /// Supersedes any pending retry with a new one.
    pub fn reconnect(&mut self) -> RetryTicket {
        self.generation += 1;
        self.attempt = self.attempt.saturating_add(1);
        self.pending = Some(self.generation);
        RetryTicket {
            generation: self.generation,
            attempt: self.attempt,
            delay: self.policy.delay(self.attempt),
        }
    }

    /// Called when a retry timer elapses. Returns true if the attempt should
    /// go ahead; stale tickets and tickets after Closed return false.
    pub fn fire(&mut self, ticket: RetryTicket) -> bool {
        if self.status == SubscriptionStatus::Closed || self.pending != Some(ticket.generation) {
            return false;
        }
        self.pending = None;
        self.status = SubscriptionStatus::Connecting;
        true
    }

    /// Forgets the attempt count, e.g. after an identity switch.
    pub fn reset(&mut self) {
        self.pending = None;
        self.attempt = 0;
        if self.status != SubscriptionStatus::Closed {
            self.status = SubscriptionStatus::Connecting;
        }
    }
}
