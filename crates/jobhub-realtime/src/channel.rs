use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use jobhub_types::events::{
    ChangeFilter, ChangeSelector, EVENT_CLOSE, EVENT_ERROR, EVENT_JOIN, EVENT_LEAVE,
    EVENT_POSTGRES_CHANGES, EVENT_PRESENCE, EVENT_PRESENCE_DIFF, EVENT_PRESENCE_STATE,
    EVENT_REPLY, EVENT_SYSTEM, PresenceDiff, PresenceState, apply_presence_diff,
};
use jobhub_types::{Frame, RawChange, UserId};

use crate::config::RealtimeConfig;
use crate::identity::IdentitySource;
use crate::presence::online_set;
use crate::reconnect::{Reconnector, SubscriptionStatus};
use crate::transport::{Connection, Transport};

/// Logical role of a subscription. At most one is active per purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Notifications,
    Messages,
    Presence,
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Notifications => "notifications",
            Self::Messages => "messages",
            Self::Presence => "presence",
        };
        f.write_str(s)
    }
}

/// A row-change filter whose value is the subscriber's identity.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterTemplate {
    pub event: ChangeSelector,
    pub schema: String,
    pub table: String,
    /// Foreign-key column that must equal the identity.
    pub column: Option<String>,
}

impl FilterTemplate {
    /// All change kinds on `public.{table}` where `{column} = identity`.
    pub fn new(table: &str, column: &str) -> Self {
        Self {
            event: ChangeSelector::All,
            schema: "public".into(),
            table: table.into(),
            column: Some(column.into()),
        }
    }

    pub fn bind(&self, identity: UserId) -> ChangeFilter {
        ChangeFilter {
            event: self.event,
            schema: self.schema.clone(),
            table: self.table.clone(),
            filter: self
                .column
                .as_ref()
                .map(|column| format!("{}=eq.{}", column, identity)),
        }
    }
}

/// What to subscribe to.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub purpose: Purpose,
    /// Fixed channel name shared by all users (presence). Per-user channels
    /// get a unique name on every attempt.
    pub shared_name: Option<String>,
    pub changes: Vec<FilterTemplate>,
    pub track_presence: bool,
}

impl ChannelSpec {
    pub fn changes(purpose: Purpose, filter: FilterTemplate) -> Self {
        Self {
            purpose,
            shared_name: None,
            changes: vec![filter],
            track_presence: false,
        }
    }

    pub fn presence(name: &str) -> Self {
        Self {
            purpose: Purpose::Presence,
            shared_name: Some(name.into()),
            changes: Vec::new(),
            track_presence: true,
        }
    }

    pub fn with_filter(mut self, filter: FilterTemplate) -> Self {
        self.changes.push(filter);
        self
    }

    /// `{purpose}:{identity}:{unix millis}` for per-user channels.
    pub fn channel_name(&self, identity: UserId, at: DateTime<Utc>) -> String {
        match &self.shared_name {
            Some(name) => name.clone(),
            None => format!("{}:{}:{}", self.purpose, identity, at.timestamp_millis()),
        }
    }

    pub fn join_payload(&self, identity: UserId, access_token: Option<&str>) -> Value {
        let changes: Vec<ChangeFilter> = self.changes.iter().map(|f| f.bind(identity)).collect();
        let presence_key = if self.track_presence {
            identity.to_string()
        } else {
            String::new()
        };
        let mut payload = json!({
            "config": {
                "broadcast": {"ack": false, "self": false},
                "presence": {"key": presence_key},
                "postgres_changes": changes,
                "private": false
            }
        });
        if let Some(token) = access_token {
            payload["access_token"] = Value::String(token.to_string());
        }
        payload
    }
}

pub fn topic_for(name: &str) -> String {
    format!("realtime:{}", name)
}

/// Delivered to a subscription's callback.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Change(RawChange),
    /// Full presence set. `seq` increases with arrival order across all
    /// subscriptions of one subscriber.
    PresenceSync { seq: u64, online: BTreeSet<UserId> },
}

type EventCallback = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

struct ActiveSubscription {
    id: Uuid,
    cancel: CancellationToken,
}

struct SubscriberInner<T> {
    transport: T,
    identity: Arc<dyn IdentitySource>,
    config: RealtimeConfig,
    /// purpose -> the subscription currently allowed to deliver events
    active: RwLock<HashMap<Purpose, ActiveSubscription>>,
    presence_seq: AtomicU64,
}

impl<T> SubscriberInner<T> {
    async fn is_current(&self, purpose: Purpose, id: Uuid) -> bool {
        self.active
            .read()
            .await
            .get(&purpose)
            .is_some_and(|active| active.id == id)
    }

    /// Unregisters the subscription, but only if it still owns the purpose.
    async fn release(&self, purpose: Purpose, id: Uuid) {
        let mut active = self.active.write().await;
        if active.get(&purpose).is_some_and(|a| a.id == id) {
            active.remove(&purpose);
        }
    }
}

/// Opens subscriptions on the realtime service.
pub struct ChannelSubscriber<T> {
    inner: Arc<SubscriberInner<T>>,
}

impl<T> Clone for ChannelSubscriber<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> ChannelSubscriber<T> {
    pub fn new(transport: T, identity: Arc<dyn IdentitySource>, config: RealtimeConfig) -> Self {
        Self {
            inner: Arc::new(SubscriberInner {
                transport,
                identity,
                config,
                active: RwLock::new(HashMap::new()),
                presence_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Opens a subscription, tearing down any existing one for the same
    /// purpose first. Without an identity this is a no-op returning an
    /// inactive handle.
    pub async fn open<F>(&self, spec: ChannelSpec, on_event: F) -> SubscriptionHandle
    where
        F: Fn(ChannelEvent) + Send + Sync + 'static,
    {
        let purpose = spec.purpose;
        if self.inner.identity.resolve().is_none() {
            debug!("No identity, not opening {} subscription", purpose);
            return SubscriptionHandle::inactive(purpose);
        }

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        {
            let mut active = self.inner.active.write().await;
            if let Some(previous) = active.insert(
                purpose,
                ActiveSubscription {
                    id,
                    cancel: cancel.clone(),
                },
            ) {
                debug!("Replacing existing {} subscription", purpose);
                previous.cancel.cancel();
            }
        }

        let (status_tx, status_rx) = watch::channel(SubscriptionStatus::Connecting);
        let task = tokio::spawn(run_subscription(
            self.inner.clone(),
            spec,
            id,
            Arc::new(on_event),
            status_tx,
            cancel.clone(),
        ));

        SubscriptionHandle {
            purpose,
            id: Some(id),
            status: status_rx,
            cancel,
            task: Some(task),
        }
    }

    /// Purposes with a live subscription.
    pub async fn active_purposes(&self) -> Vec<Purpose> {
        self.inner.active.read().await.keys().copied().collect()
    }
}

/// Owner's side of a subscription. Dropping it tears the subscription down.
pub struct SubscriptionHandle {
    purpose: Purpose,
    id: Option<Uuid>,
    status: watch::Receiver<SubscriptionStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    fn inactive(purpose: Purpose) -> Self {
        let (_, status) = watch::channel(SubscriptionStatus::Closed);
        Self {
            purpose,
            id: None,
            status,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn is_active(&self) -> bool {
        self.id.is_some() && *self.status.borrow() != SubscriptionStatus::Closed
    }

    pub fn status(&self) -> SubscriptionStatus {
        *self.status.borrow()
    }

    /// Status updates, for surfaces that show connection state.
    pub fn watch_status(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status.clone()
    }

    /// Waits until the subscription reaches `status`. Returns false if the
    /// subscription ended without reaching it.
    pub async fn wait_for(&mut self, status: SubscriptionStatus) -> bool {
        self.status.wait_for(|s| *s == status).await.is_ok()
    }

    /// Untracks, leaves the channel and waits for the task to finish.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// How one connected session ended.
enum SessionEnd {
    Failed(SubscriptionStatus),
    IdentityChanged,
    Superseded,
    Cancelled,
}

async fn run_subscription<T: Transport>(
    inner: Arc<SubscriberInner<T>>,
    spec: ChannelSpec,
    id: Uuid,
    on_event: EventCallback,
    status_tx: watch::Sender<SubscriptionStatus>,
    cancel: CancellationToken,
) {
    let purpose = spec.purpose;
    let mut reconnector = Reconnector::new(inner.config.backoff.clone());

    loop {
        // Identity is resolved fresh on every attempt
        let Some(identity) = inner.identity.resolve() else {
            info!("{} subscription lost its identity, closing", purpose);
            break;
        };

        status_tx.send_replace(SubscriptionStatus::Connecting);
        let end = run_session(
            &inner,
            &spec,
            id,
            identity,
            &on_event,
            &status_tx,
            &mut reconnector,
            &cancel,
        )
        .await;

        match end {
            SessionEnd::Cancelled | SessionEnd::Superseded => break,
            SessionEnd::IdentityChanged => {
                info!("{} subscription identity changed, reopening", purpose);
                reconnector.reset();
            }
            SessionEnd::Failed(status) => {
                status_tx.send_replace(status);
                let Some(ticket) = reconnector.transition(status) else {
                    break;
                };
                info!(
                    "{} subscription {}, retry #{} in {:?}",
                    purpose, status, ticket.attempt, ticket.delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ticket.delay) => {}
                }
                if !reconnector.fire(ticket) {
                    break;
                }
            }
        }
    }

    reconnector.transition(SubscriptionStatus::Closed);
    status_tx.send_replace(SubscriptionStatus::Closed);
    inner.release(purpose, id).await;
    debug!("{} subscription closed", purpose);
}

#[allow(clippy::too_many_arguments)]
async fn run_session<T: Transport>(
    inner: &SubscriberInner<T>,
    spec: &ChannelSpec,
    id: Uuid,
    identity: UserId,
    on_event: &EventCallback,
    status_tx: &watch::Sender<SubscriptionStatus>,
    reconnector: &mut Reconnector,
    cancel: &CancellationToken,
) -> SessionEnd {
    let purpose = spec.purpose;

    let connected = tokio::select! {
        _ = cancel.cancelled() => return SessionEnd::Cancelled,
        connected = inner.transport.connect() => connected,
    };
    let mut conn = match connected {
        Ok(conn) => conn,
        Err(e) => {
            warn!("{} subscription failed to connect: {}", purpose, e);
            return SessionEnd::Failed(SubscriptionStatus::Error);
        }
    };

    let name = spec.channel_name(identity, Utc::now());
    let topic = topic_for(&name);
    let mut refs = RefCounter::default();

    // -- Join --

    let join_ref = refs.next();
    let token = inner.identity.access_token();
    let join = Frame::new(
        topic.clone(),
        EVENT_JOIN,
        spec.join_payload(identity, token.as_deref()),
    )
    .with_ref(join_ref.clone());
    if !conn.send(join) {
        return SessionEnd::Failed(SubscriptionStatus::Error);
    }

    let reply = tokio::select! {
        _ = cancel.cancelled() => return SessionEnd::Cancelled,
        reply = tokio::time::timeout(
            inner.config.join_timeout,
            wait_for_reply(&mut conn, &topic, &join_ref),
        ) => reply,
    };
    match reply {
        Err(_) => {
            warn!("{} join on {} timed out", purpose, topic);
            return SessionEnd::Failed(SubscriptionStatus::TimedOut);
        }
        Ok(None) => {
            warn!("{} connection closed before join reply", purpose);
            return SessionEnd::Failed(SubscriptionStatus::Error);
        }
        Ok(Some(status)) if status != "ok" => {
            warn!("{} join on {} rejected: {}", purpose, topic, status);
            return SessionEnd::Failed(SubscriptionStatus::Error);
        }
        Ok(Some(_)) => {}
    }

    if spec.track_presence && !conn.send(presence_frame(&topic, refs.next(), "track", Some(identity))) {
        warn!("{} connection closed before presence track", purpose);
        return SessionEnd::Failed(SubscriptionStatus::Error);
    }

    reconnector.transition(SubscriptionStatus::Subscribed);
    status_tx.send_replace(SubscriptionStatus::Subscribed);
    info!("{} subscribed on {} as {}", purpose, topic, identity);

    // -- Event loop --

    let mut presence = PresenceState::new();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                leave(&conn, spec, &topic, &mut refs);
                return SessionEnd::Cancelled;
            }
            frame = conn.inbound.recv() => frame,
        };
        let Some(frame) = frame else {
            warn!("{} connection dropped", purpose);
            return SessionEnd::Failed(SubscriptionStatus::Error);
        };
        if frame.topic != topic {
            trace!("{} ignoring frame for {}", purpose, frame.topic);
            continue;
        }

        let event = match frame.event.as_str() {
            EVENT_POSTGRES_CHANGES => match RawChange::from_payload(&frame.payload) {
                Ok(change) => ChannelEvent::Change(change),
                Err(e) => {
                    warn!("{} dropping malformed change: {}", purpose, e);
                    continue;
                }
            },
            EVENT_PRESENCE_STATE => match serde_json::from_value::<PresenceState>(frame.payload) {
                Ok(state) => {
                    presence = state;
                    presence_sync(inner, &presence)
                }
                Err(e) => {
                    warn!("{} dropping malformed presence state: {}", purpose, e);
                    continue;
                }
            },
            EVENT_PRESENCE_DIFF => match serde_json::from_value::<PresenceDiff>(frame.payload) {
                Ok(diff) => {
                    apply_presence_diff(&mut presence, diff);
                    presence_sync(inner, &presence)
                }
                Err(e) => {
                    warn!("{} dropping malformed presence diff: {}", purpose, e);
                    continue;
                }
            },
            EVENT_ERROR | EVENT_CLOSE => {
                warn!("{} channel {} closed by server ({})", purpose, topic, frame.event);
                return SessionEnd::Failed(SubscriptionStatus::Error);
            }
            EVENT_SYSTEM => {
                if frame.payload.get("status").and_then(Value::as_str) == Some("error") {
                    warn!("{} system error on {}: {}", purpose, topic, frame.payload);
                    return SessionEnd::Failed(SubscriptionStatus::Error);
                }
                debug!("{} system message: {}", purpose, frame.payload);
                continue;
            }
            other => {
                trace!("{} ignoring {} frame", purpose, other);
                continue;
            }
        };

        // Stale-callback guard: only the current subscription for this
        // purpose, opened for the current identity, may deliver.
        if !inner.is_current(purpose, id).await {
            leave(&conn, spec, &topic, &mut refs);
            return SessionEnd::Superseded;
        }
        if inner.identity.resolve() != Some(identity) {
            leave(&conn, spec, &topic, &mut refs);
            return SessionEnd::IdentityChanged;
        }
        on_event(event);
    }
}

async fn wait_for_reply(conn: &mut Connection, topic: &str, reference: &str) -> Option<String> {
    while let Some(frame) = conn.inbound.recv().await {
        if frame.topic == topic
            && frame.event == EVENT_REPLY
            && frame.reference.as_deref() == Some(reference)
        {
            return Some(frame.reply_status().unwrap_or("error").to_string());
        }
        trace!("Ignoring {} on {} while joining", frame.event, frame.topic);
    }
    None
}

fn presence_sync<T>(inner: &SubscriberInner<T>, state: &PresenceState) -> ChannelEvent {
    ChannelEvent::PresenceSync {
        seq: inner.presence_seq.fetch_add(1, Ordering::SeqCst) + 1,
        online: online_set(state),
    }
}

fn presence_frame(topic: &str, reference: String, action: &str, identity: Option<UserId>) -> Frame {
    let mut payload = json!({"type": "presence", "event": action});
    if let Some(identity) = identity {
        payload["payload"] = json!({
            "user_id": identity,
            "online_at": Utc::now().to_rfc3339(),
        });
    }
    Frame::new(topic, EVENT_PRESENCE, payload).with_ref(reference)
}

fn leave(conn: &Connection, spec: &ChannelSpec, topic: &str, refs: &mut RefCounter) {
    if spec.track_presence {
        conn.send(presence_frame(topic, refs.next(), "untrack", None));
    }
    conn.send(Frame::new(topic, EVENT_LEAVE, json!({})).with_ref(refs.next()));
}

#[derive(Default)]
struct RefCounter(u64);

impl RefCounter {
    fn next(&mut self) -> String {
        self.0 += 1;
        self.0.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn uid(n: i64) -> UserId {
        UserId::new(n).unwrap()
    }

    #[test]
    fn channel_names_are_unique_per_identity_and_time() {
        let spec = ChannelSpec::changes(
            Purpose::Notifications,
            FilterTemplate::new("notifications", "user_id"),
        );
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(spec.channel_name(uid(42), at), "notifications:42:1700000000123");

        let presence = ChannelSpec::presence("online-users");
        assert_eq!(presence.channel_name(uid(42), at), "online-users");
    }

    #[test]
    fn join_payload_binds_filter_to_identity() {
        let spec = ChannelSpec::changes(Purpose::Messages, FilterTemplate::new("messages", "receiver_id"));
        let payload = spec.join_payload(uid(42), Some("tok"));
        assert_eq!(
            payload["config"]["postgres_changes"][0],
            json!({"event": "*", "schema": "public", "table": "messages", "filter": "receiver_id=eq.42"})
        );
        assert_eq!(payload["config"]["presence"]["key"], "");
        assert_eq!(payload["access_token"], "tok");

        let presence = ChannelSpec::presence("online-users").join_payload(uid(42), None);
        assert_eq!(presence["config"]["presence"]["key"], "42");
        assert!(presence.get("access_token").is_none());
    }
}
