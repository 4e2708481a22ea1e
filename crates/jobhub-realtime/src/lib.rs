//! Client-side realtime synchronization for the job board.
//!
//! Subscribes to row-change and presence channels on the hosted realtime
//! service and keeps unread tallies, the presence set and toasts in sync:
//! - `channel`: subscriptions, one per purpose, with stale-callback guards
//! - `reconnect`: subscription state machine and backoff policies
//! - `unread`, `dedup`, `presence`: the local bookkeeping
//! - `feeds`: the notification feed and chat inbox built from the above
//! - `bus`: events out to the UI, commands back in

pub mod bus;
pub mod channel;
pub mod config;
pub mod dedup;
pub mod error;
pub mod feeds;
pub mod identity;
pub mod memory;
pub mod presence;
pub mod reconnect;
pub mod transport;
pub mod unread;

pub use bus::{EventBus, SyncCommand, SyncEvent};
pub use channel::{ChannelEvent, ChannelSpec, ChannelSubscriber, FilterTemplate, Purpose, SubscriptionHandle};
pub use config::RealtimeConfig;
pub use dedup::{DedupPolicy, DuplicateGuard};
pub use error::RealtimeError;
pub use feeds::{ChatFeed, NotificationFeed};
pub use identity::{IdentitySource, StoredIdentity};
pub use presence::PresenceTracker;
pub use reconnect::{BackoffPolicy, Reconnector, RetryTicket, SubscriptionStatus};
pub use transport::{Connection, Transport, WsTransport};
pub use unread::{TallyKey, UnreadCounter, UnreadStrategy, UnreadTally};
