use std::time::Duration;

use crate::dedup::DedupPolicy;
use crate::reconnect::BackoffPolicy;

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Tuning for subscriptions. Built by the host from its own configuration.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// How long to wait for the join reply before the subscription times out.
    pub join_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffPolicy,
    pub dedup: DedupPolicy,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            backoff: BackoffPolicy::default(),
            dedup: DedupPolicy::default(),
        }
    }
}
