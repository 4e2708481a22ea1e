//! The two consumers of pushed changes: the notification feed and the chat
//! inbox. Each owns its duplicate guard and tallies and reports through the
//! [`EventBus`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use jobhub_store::Database;
use jobhub_types::events::RowChange;
use jobhub_types::models::id_as_string;
use jobhub_types::{MessageRow, NotificationRow, RawChange, UserId};

use crate::bus::{EventBus, SyncCommand, SyncEvent};
use crate::channel::{ChannelEvent, ChannelSpec, FilterTemplate, Purpose};
use crate::dedup::{DedupPolicy, DuplicateGuard};
use crate::identity::IdentitySource;
use crate::presence::PresenceTracker;
use crate::unread::{TallyKey, UnreadCounter, UnreadStrategy, UnreadTally};

/// Name of the presence channel every signed-in user joins.
pub const PRESENCE_CHANNEL: &str = "online-users";

const NOTIFICATIONS_TABLE: &str = "notifications";
const MESSAGES_TABLE: &str = "messages";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Who a feed's state belongs to, checked against the identity source.
enum Binding {
    Same(UserId),
    Switched(UserId),
    SignedOut,
}

fn bind(source: Option<&Arc<dyn IdentitySource>>, me: UserId) -> Binding {
    let Some(source) = source else {
        return Binding::Same(me);
    };
    match source.resolve() {
        Some(current) if current == me => Binding::Same(me),
        Some(current) => Binding::Switched(current),
        None => Binding::SignedOut,
    }
}

/// Update records may carry only the columns that changed.
#[derive(Debug, Deserialize)]
struct SeenMarker {
    #[serde(deserialize_with = "id_as_string")]
    id: String,
    #[serde(default)]
    user_id: Option<UserId>,
    #[serde(default)]
    seen: bool,
}

// -- Notifications --

struct NotificationState {
    me: UserId,
    guard: DuplicateGuard,
    tally: UnreadTally,
    /// id -> seen, for every notification we know of
    rows: HashMap<String, bool>,
}

pub struct NotificationFeed {
    identity: Option<Arc<dyn IdentitySource>>,
    bus: EventBus,
    state: Mutex<NotificationState>,
}

impl NotificationFeed {
    pub fn new(me: UserId, dedup: DedupPolicy, bus: EventBus) -> Self {
        Self {
            identity: None,
            bus,
            state: Mutex::new(NotificationState {
                me,
                guard: DuplicateGuard::new(dedup),
                tally: UnreadTally::new(),
                rows: HashMap::new(),
            }),
        }
    }

    /// Follows the signed-in user: when it changes, the previous user's
    /// state is dropped before the next event or seed is applied.
    pub fn with_identity(mut self, source: Arc<dyn IdentitySource>) -> Self {
        self.identity = Some(source);
        self
    }

    /// All changes to the signed-in user's notifications.
    pub fn channel_spec() -> ChannelSpec {
        ChannelSpec::changes(
            Purpose::Notifications,
            FilterTemplate::new(NOTIFICATIONS_TABLE, "user_id"),
        )
    }

    /// Re-checks the signed-in user. Returns `None` when signed out.
    pub fn refresh_identity(&self) -> Option<UserId> {
        let mut events = Vec::new();
        let me = self.bind(&mut lock(&self.state), &mut events);
        self.publish_all(events);
        me
    }

    fn bind(&self, state: &mut NotificationState, events: &mut Vec<SyncEvent>) -> Option<UserId> {
        match bind(self.identity.as_ref(), state.me) {
            Binding::Same(me) => Some(me),
            Binding::SignedOut => None,
            Binding::Switched(me) => {
                info!("Notification feed switching from user {} to {}", state.me, me);
                state.me = me;
                state.guard.clear();
                state.tally.clear();
                state.rows.clear();
                events.push(SyncEvent::IdentityChanged { identity: me });
                events.push(unread_changed(TallyKey::Notifications, 0));
                Some(me)
            }
        }
    }

    /// Seeds the unread count from a fetched list.
    pub fn seed(&self, rows: &[NotificationRow]) {
        let mut events = Vec::new();
        {
            let mut state = lock(&self.state);
            if let Some(me) = self.bind(&mut state, &mut events) {
                state.rows = rows
                    .iter()
                    .filter(|row| row.user_id == me)
                    .map(|row| (row.id.clone(), row.seen))
                    .collect();
                let unseen = state.rows.values().filter(|seen| !**seen).count() as u32;
                state.tally.reset_to(TallyKey::Notifications, unseen);
                events.push(unread_changed(TallyKey::Notifications, unseen));
            }
        }
        self.publish_all(events);
    }

    pub fn unread(&self) -> u32 {
        lock(&self.state).tally.get(TallyKey::Notifications)
    }

    pub fn handle(&self, event: ChannelEvent) {
        let ChannelEvent::Change(change) = event else {
            return;
        };
        if change.table != NOTIFICATIONS_TABLE {
            return;
        }

        let mut events = Vec::new();
        {
            let mut state = lock(&self.state);
            let Some(me) = self.bind(&mut state, &mut events) else {
                debug!("Signed out, dropping notification {}", change.kind);
                return;
            };
            if !state.guard.admit(&change.event_key()) {
                debug!("Suppressed duplicate {} on notification {:?}", change.kind, change.row_id());
            } else {
                match change.parse::<NotificationRow>() {
                    Ok(RowChange::Insert { new }) => on_notification_insert(&mut state, me, new, &mut events),
                    Ok(RowChange::Update { .. }) => on_notification_update(&mut state, me, &change, &mut events),
                    Ok(RowChange::Delete { id, .. }) => {
                        if let Some(false) = id.and_then(|id| state.rows.remove(&id)) {
                            let count = state.tally.decrement(TallyKey::Notifications);
                            events.push(unread_changed(TallyKey::Notifications, count));
                        }
                    }
                    // Partial update records do not parse as full rows
                    Err(_) if change.kind == jobhub_types::ChangeKind::Update => {
                        on_notification_update(&mut state, me, &change, &mut events)
                    }
                    Err(e) => warn!("Dropping notification change: {}", e),
                }
            }
        }
        self.publish_all(events);
    }

    /// Marks everything seen locally. The REST delete is the caller's job.
    pub fn mark_all_read(&self) {
        {
            let mut state = lock(&self.state);
            state.rows.values_mut().for_each(|seen| *seen = true);
            state.tally.reset_to(TallyKey::Notifications, 0);
        }
        self.publish_count(0);
    }

    pub fn reset_to(&self, value: u32) {
        lock(&self.state).tally.reset_to(TallyKey::Notifications, value);
        self.publish_count(value);
    }

    fn publish_count(&self, count: u32) {
        self.bus.publish(unread_changed(TallyKey::Notifications, count));
    }

    fn publish_all(&self, events: Vec<SyncEvent>) {
        for event in events {
            self.bus.publish(event);
        }
    }
}

fn on_notification_insert(
    state: &mut NotificationState,
    me: UserId,
    row: NotificationRow,
    events: &mut Vec<SyncEvent>,
) {
    if row.user_id != me {
        return;
    }
    events.push(SyncEvent::Toast {
        title: row.title.clone().unwrap_or_else(|| "New notification".into()),
        body: row.message.clone(),
    });
    let known = state.rows.insert(row.id, row.seen).is_some();
    if !row.seen && !known {
        let count = state.tally.increment(TallyKey::Notifications);
        events.push(unread_changed(TallyKey::Notifications, count));
    }
}

fn on_notification_update(
    state: &mut NotificationState,
    me: UserId,
    change: &RawChange,
    events: &mut Vec<SyncEvent>,
) {
    let marker = match serde_json::from_value::<SeenMarker>(change.record.clone()) {
        Ok(marker) => marker,
        Err(e) => {
            warn!("Dropping notification update: {}", e);
            return;
        }
    };
    if marker.user_id.is_some_and(|owner| owner != me) {
        return;
    }

    // Only rows seeded or inserted here are in the tally
    let Some(was_seen) = state.rows.get(&marker.id).copied() else {
        debug!("Update for untracked notification {}", marker.id);
        return;
    };
    state.rows.insert(marker.id, marker.seen);
    let count = match (was_seen, marker.seen) {
        (false, true) => state.tally.decrement(TallyKey::Notifications),
        (true, false) => state.tally.increment(TallyKey::Notifications),
        _ => return,
    };
    events.push(unread_changed(TallyKey::Notifications, count));
}

// -- Chat --

struct ChatState {
    me: UserId,
    guard: DuplicateGuard,
    counter: UnreadCounter,
    presence: PresenceTracker,
}

/// Chat inbox: per-conversation unread counts plus who is online.
pub struct ChatFeed {
    identity: Option<Arc<dyn IdentitySource>>,
    bus: EventBus,
    store: Option<Arc<Database>>,
    state: Mutex<ChatState>,
}

impl ChatFeed {
    pub fn new(me: UserId, strategy: UnreadStrategy, dedup: DedupPolicy, bus: EventBus) -> Self {
        Self {
            identity: None,
            bus,
            store: None,
            state: Mutex::new(ChatState {
                me,
                guard: DuplicateGuard::new(dedup),
                counter: UnreadCounter::new(me, strategy),
                presence: PresenceTracker::new(),
            }),
        }
    }

    /// Persists "last chat open" on open and mark-all-read.
    pub fn with_store(mut self, db: Arc<Database>) -> Self {
        self.store = Some(db);
        self
    }

    /// Follows the signed-in user, like [`NotificationFeed::with_identity`].
    pub fn with_identity(mut self, source: Arc<dyn IdentitySource>) -> Self {
        self.identity = Some(source);
        self
    }

    /// All changes to messages addressed to the signed-in user.
    pub fn messages_spec() -> ChannelSpec {
        ChannelSpec::changes(Purpose::Messages, FilterTemplate::new(MESSAGES_TABLE, "receiver_id"))
    }

    pub fn presence_spec() -> ChannelSpec {
        ChannelSpec::presence(PRESENCE_CHANNEL)
    }

    pub fn strategy(&self) -> UnreadStrategy {
        lock(&self.state).counter.strategy()
    }

    /// Re-checks the signed-in user. Returns `None` when signed out.
    pub fn refresh_identity(&self) -> Option<UserId> {
        let mut events = Vec::new();
        let me = self.bind(&mut lock(&self.state), &mut events);
        self.publish_all(events);
        me
    }

    fn bind(&self, state: &mut ChatState, events: &mut Vec<SyncEvent>) -> Option<UserId> {
        match bind(self.identity.as_ref(), state.me) {
            Binding::Same(me) => Some(me),
            Binding::SignedOut => None,
            Binding::Switched(me) => {
                info!("Chat feed switching from user {} to {}", state.me, me);
                let strategy = match state.counter.strategy() {
                    UnreadStrategy::TimestampBased { .. } => UnreadStrategy::TimestampBased {
                        last_seen: self.last_chat_open(me),
                    },
                    flag => flag,
                };
                for contact in state.counter.unread_contacts() {
                    events.push(unread_changed(TallyKey::Conversation(contact), 0));
                }
                state.me = me;
                state.counter = UnreadCounter::new(me, strategy);
                state.guard.clear();
                state.presence.clear();
                events.push(SyncEvent::IdentityChanged { identity: me });
                events.push(SyncEvent::PresenceChanged { online: 0 });
                Some(me)
            }
        }
    }

    /// Seeds per-conversation counts from fetched messages.
    pub fn seed(&self, rows: &[MessageRow]) {
        let mut events = Vec::new();
        {
            let mut state = lock(&self.state);
            if let Some(me) = self.bind(&mut state, &mut events) {
                state.counter.recount(rows);
                let mut contacts: Vec<UserId> = rows.iter().map(|row| row.counterpart(me)).collect();
                contacts.sort();
                contacts.dedup();
                for contact in contacts {
                    let count = state.counter.get(contact);
                    events.push(unread_changed(TallyKey::Conversation(contact), count));
                }
            }
        }
        self.publish_all(events);
    }

    pub fn unread(&self, contact: UserId) -> u32 {
        lock(&self.state).counter.get(contact)
    }

    pub fn total_unread(&self) -> u32 {
        lock(&self.state).counter.total()
    }

    pub fn active_conversation(&self) -> Option<UserId> {
        lock(&self.state).counter.active()
    }

    pub fn handle_message(&self, event: ChannelEvent) {
        let ChannelEvent::Change(change) = event else {
            return;
        };
        if change.table != MESSAGES_TABLE {
            return;
        }

        let mut events = Vec::new();
        {
            let mut state = lock(&self.state);
            if self.bind(&mut state, &mut events).is_none() {
                debug!("Signed out, dropping message {}", change.kind);
                return;
            }
            if !state.guard.admit(&change.event_key()) {
                debug!("Suppressed duplicate {} on message {:?}", change.kind, change.row_id());
            } else {
                match change.parse::<MessageRow>() {
                    Ok(RowChange::Insert { new }) => {
                        if let Some(count) = state.counter.on_insert(&new) {
                            events.push(SyncEvent::Toast {
                                title: "New message".into(),
                                body: new.content.clone(),
                            });
                            events.push(unread_changed(TallyKey::Conversation(new.sender_id), count));
                        }
                    }
                    Ok(RowChange::Update { new, .. }) => {
                        if let Some(count) = state.counter.on_update(&new) {
                            events.push(unread_changed(TallyKey::Conversation(new.sender_id), count));
                        }
                    }
                    Ok(RowChange::Delete { .. }) => {}
                    Err(e) => warn!("Dropping message change: {}", e),
                }
            }
        }
        self.publish_all(events);
    }

    pub fn handle_presence(&self, event: ChannelEvent) {
        let ChannelEvent::PresenceSync { seq, online } = event else {
            return;
        };
        let mut events = Vec::new();
        {
            let mut state = lock(&self.state);
            if self.bind(&mut state, &mut events).is_some() {
                if state.presence.apply_sync(seq, online) {
                    let online = state.presence.online_count();
                    events.push(SyncEvent::PresenceChanged { online });
                } else {
                    debug!("Ignoring stale presence sync #{}", seq);
                }
            }
        }
        self.publish_all(events);
    }

    pub fn is_online(&self, id: UserId) -> bool {
        lock(&self.state).presence.is_online(id)
    }

    pub fn online(&self) -> Vec<UserId> {
        lock(&self.state).presence.online()
    }

    /// Makes `contact` the active conversation and zeroes its count.
    pub fn open_conversation(&self, contact: UserId) {
        let me = {
            let mut state = lock(&self.state);
            state.counter.open_conversation(contact);
            state.me
        };
        self.touch_last_chat_open(me);
        self.bus.publish(unread_changed(TallyKey::Conversation(contact), 0));
    }

    pub fn close_conversation(&self) {
        lock(&self.state).counter.close_conversation();
    }

    pub fn reset_to(&self, contact: UserId, value: u32) {
        lock(&self.state).counter.reset_to(contact, value);
        self.bus.publish(unread_changed(TallyKey::Conversation(contact), value));
    }

    pub fn mark_all_read(&self) {
        let (me, cleared) = {
            let mut state = lock(&self.state);
            (state.me, state.counter.mark_all_read(Utc::now()))
        };
        self.touch_last_chat_open(me);
        for contact in cleared {
            self.bus.publish(unread_changed(TallyKey::Conversation(contact), 0));
        }
    }

    fn touch_last_chat_open(&self, me: UserId) {
        if let Some(db) = &self.store {
            if let Err(e) = db.set_last_chat_open(me, Utc::now()) {
                warn!("Failed to persist last chat open: {}", e);
            }
        }
    }

    fn last_chat_open(&self, me: UserId) -> Option<chrono::DateTime<Utc>> {
        let db = self.store.as_ref()?;
        db.last_chat_open(me).unwrap_or_else(|e| {
            warn!("Failed to read last chat open: {}", e);
            None
        })
    }

    fn publish_all(&self, events: Vec<SyncEvent>) {
        for event in events {
            self.bus.publish(event);
        }
    }
}

fn unread_changed(key: TallyKey, count: u32) -> SyncEvent {
    SyncEvent::UnreadChanged { key, count }
}

/// Applies UI commands from the bus until `shutdown` fires.
pub async fn run_commands(
    bus: EventBus,
    notifications: Arc<NotificationFeed>,
    chat: Arc<ChatFeed>,
    shutdown: CancellationToken,
) {
    let mut commands = bus.subscribe_commands();
    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => command,
        };
        let command = match command {
            Ok(command) => command,
            Err(RecvError::Lagged(n)) => {
                warn!("Command loop lagged, {} commands dropped", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        debug!("Command: {:?}", command);
        match command {
            SyncCommand::ResetUnread(TallyKey::Notifications) => notifications.reset_to(0),
            SyncCommand::ResetUnread(TallyKey::Conversation(contact)) => chat.reset_to(contact, 0),
            SyncCommand::OpenConversation(contact) => chat.open_conversation(contact),
            SyncCommand::CloseConversation => chat.close_conversation(),
            SyncCommand::MarkAllRead => {
                notifications.mark_all_read();
                chat.mark_all_read();
            }
        }
    }
    info!("Command loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StoredIdentity;
    use serde_json::{Value, json};
    use tokio::sync::broadcast;

    fn uid(n: i64) -> UserId {
        UserId::new(n).unwrap()
    }

    fn change(kind: &str, table: &str, record: Value, old: Value, at: &str) -> ChannelEvent {
        ChannelEvent::Change(
            RawChange::from_payload(&json!({
                "data": {
                    "type": kind,
                    "schema": "public",
                    "table": table,
                    "record": record,
                    "old_record": old,
                    "commit_timestamp": at
                }
            }))
            .unwrap(),
        )
    }

    fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn toasts(events: &[SyncEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, SyncEvent::Toast { .. }))
            .count()
    }

    #[test]
    fn notification_insert_then_seen_update() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let feed = NotificationFeed::new(uid(42), DedupPolicy::default(), bus);

        feed.handle(change(
            "INSERT",
            "notifications",
            json!({"id": "n1", "user_id": 42, "message": "Your application was viewed"}),
            Value::Null,
            "2024-05-01T10:00:00Z",
        ));
        assert_eq!(feed.unread(), 1);
        let events = drain(&mut rx);
        assert_eq!(toasts(&events), 1);
        assert!(events.contains(&SyncEvent::UnreadChanged {
            key: TallyKey::Notifications,
            count: 1
        }));

        feed.handle(change(
            "UPDATE",
            "notifications",
            json!({"id": "n1", "seen": true}),
            json!({"id": "n1"}),
            "2024-05-01T10:01:00Z",
        ));
        assert_eq!(feed.unread(), 0);
        assert_eq!(
            drain(&mut rx),
            vec![SyncEvent::UnreadChanged {
                key: TallyKey::Notifications,
                count: 0
            }]
        );
    }

    #[test]
    fn redelivered_insert_toasts_once() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let feed = NotificationFeed::new(uid(42), DedupPolicy::default(), bus);
        let insert = change(
            "INSERT",
            "notifications",
            json!({"id": "n1", "user_id": 42, "title": "Hi", "message": "x"}),
            Value::Null,
            "2024-05-01T10:00:00Z",
        );

        feed.handle(insert.clone());
        feed.handle(insert);
        assert_eq!(toasts(&drain(&mut rx)), 1);
        assert_eq!(feed.unread(), 1);
    }

    #[test]
    fn seeded_unread_and_repeated_seen_updates_clamp() {
        let feed = NotificationFeed::new(uid(42), DedupPolicy::default(), EventBus::new());
        let rows: Vec<NotificationRow> = serde_json::from_value(json!([
            {"id": 1, "user_id": 42, "message": "a", "seen": false},
            {"id": 2, "user_id": 42, "message": "b", "seen": true},
        ]))
        .unwrap();
        feed.seed(&rows);
        assert_eq!(feed.unread(), 1);

        for at in ["2024-05-01T10:00:00Z", "2024-05-01T10:00:01Z"] {
            feed.handle(change(
                "UPDATE",
                "notifications",
                json!({"id": 1, "user_id": 42, "message": "a", "seen": true}),
                Value::Null,
                at,
            ));
        }
        assert_eq!(feed.unread(), 0);

        feed.mark_all_read();
        assert_eq!(feed.unread(), 0);
    }

    #[test]
    fn notification_for_someone_else_is_ignored() {
        let feed = NotificationFeed::new(uid(42), DedupPolicy::default(), EventBus::new());
        feed.handle(change(
            "INSERT",
            "notifications",
            json!({"id": "n9", "user_id": 7, "message": "not yours"}),
            Value::Null,
            "2024-05-01T10:00:00Z",
        ));
        assert_eq!(feed.unread(), 0);
    }

    fn message(id: i64, from: i64, to: i64, seen: bool) -> Value {
        json!({
            "id": id,
            "sender_id": from,
            "receiver_id": to,
            "content": format!("m{}", id),
            "seen": seen,
            "created_at": "2024-05-01T10:00:00Z"
        })
    }

    #[test]
    fn chat_counts_inserts_outside_active_conversation() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let chat = ChatFeed::new(uid(42), UnreadStrategy::FlagBased, DedupPolicy::default(), bus);

        chat.handle_message(change("INSERT", "messages", message(1, 7, 42, false), Value::Null, "t1"));
        chat.handle_message(change("INSERT", "messages", message(2, 7, 42, false), Value::Null, "t2"));
        chat.handle_message(change("INSERT", "messages", message(3, 8, 42, false), Value::Null, "t3"));
        assert_eq!(chat.unread(uid(7)), 2);
        assert_eq!(chat.total_unread(), 3);
        assert_eq!(toasts(&drain(&mut rx)), 3);

        chat.open_conversation(uid(7));
        assert_eq!(chat.unread(uid(7)), 0);
        chat.handle_message(change("INSERT", "messages", message(4, 7, 42, false), Value::Null, "t4"));
        assert_eq!(chat.unread(uid(7)), 0);

        chat.close_conversation();
        chat.handle_message(change("INSERT", "messages", message(5, 7, 42, false), Value::Null, "t5"));
        assert_eq!(chat.unread(uid(7)), 1);

        chat.handle_message(change(
            "UPDATE",
            "messages",
            message(3, 8, 42, true),
            json!({"id": 3}),
            "t6",
        ));
        assert_eq!(chat.unread(uid(8)), 0);
    }

    #[test]
    fn reading_message_received_in_open_conversation_keeps_badge() {
        let chat = ChatFeed::new(uid(42), UnreadStrategy::FlagBased, DedupPolicy::default(), EventBus::new());
        chat.open_conversation(uid(7));
        chat.handle_message(change("INSERT", "messages", message(1, 7, 42, false), Value::Null, "t1"));
        chat.close_conversation();
        chat.handle_message(change("INSERT", "messages", message(2, 7, 42, false), Value::Null, "t2"));
        assert_eq!(chat.unread(uid(7)), 1);

        // Old record carries only the primary key
        chat.handle_message(change("UPDATE", "messages", message(1, 7, 42, true), json!({"id": 1}), "t3"));
        assert_eq!(chat.unread(uid(7)), 1);
        let mut edited = message(1, 7, 42, true);
        edited["content"] = json!("edited");
        chat.handle_message(change("UPDATE", "messages", edited, json!({"id": 1}), "t4"));
        assert_eq!(chat.unread(uid(7)), 1);

        chat.handle_message(change("UPDATE", "messages", message(2, 7, 42, true), json!({"id": 2}), "t5"));
        assert_eq!(chat.unread(uid(7)), 0);
    }

    fn signed_in(user: i64) -> Arc<StoredIdentity> {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let identity = Arc::new(StoredIdentity::new(db));
        identity.set_session(UserId::new(user));
        identity
    }

    #[test]
    fn notification_feed_follows_identity_switch() {
        let identity = signed_in(42);
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let feed = NotificationFeed::new(uid(42), DedupPolicy::default(), bus).with_identity(identity.clone());

        feed.handle(change("INSERT", "notifications", json!({"id": "n1", "user_id": 42}), Value::Null, "t1"));
        assert_eq!(feed.unread(), 1);
        drain(&mut rx);

        identity.set_session(UserId::new(7));
        feed.handle(change("INSERT", "notifications", json!({"id": "n2", "user_id": 7}), Value::Null, "t2"));
        assert_eq!(feed.unread(), 1);
        let events = drain(&mut rx);
        assert_eq!(toasts(&events), 1);
        assert!(events.contains(&SyncEvent::IdentityChanged { identity: uid(7) }));

        // The previous user's rows are gone with their tally
        feed.handle(change("UPDATE", "notifications", json!({"id": "n1", "seen": true}), Value::Null, "t3"));
        assert_eq!(feed.unread(), 1);

        identity.set_session(None);
        feed.handle(change("INSERT", "notifications", json!({"id": "n3", "user_id": 7}), Value::Null, "t4"));
        assert_eq!(feed.unread(), 1);
        assert_eq!(feed.refresh_identity(), None);
    }

    #[test]
    fn chat_feed_follows_identity_switch() {
        let identity = signed_in(42);
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let chat = ChatFeed::new(uid(42), UnreadStrategy::FlagBased, DedupPolicy::default(), bus)
            .with_identity(identity.clone());

        chat.handle_message(change("INSERT", "messages", message(1, 9, 42, false), Value::Null, "t1"));
        chat.handle_presence(ChannelEvent::PresenceSync {
            seq: 1,
            online: [uid(9), uid(42)].into_iter().collect(),
        });
        assert_eq!(chat.unread(uid(9)), 1);
        drain(&mut rx);

        identity.set_session(UserId::new(7));
        assert_eq!(chat.refresh_identity(), Some(uid(7)));
        assert_eq!(chat.total_unread(), 0);
        assert!(chat.online().is_empty());
        let events = drain(&mut rx);
        assert!(events.contains(&SyncEvent::IdentityChanged { identity: uid(7) }));
        assert!(events.contains(&SyncEvent::UnreadChanged {
            key: TallyKey::Conversation(uid(9)),
            count: 0
        }));

        chat.handle_message(change("INSERT", "messages", message(2, 9, 7, false), Value::Null, "t2"));
        assert_eq!(chat.unread(uid(9)), 1);
        // Same identity again: nothing is reset
        assert_eq!(chat.refresh_identity(), Some(uid(7)));
        assert_eq!(chat.unread(uid(9)), 1);
    }

    #[test]
    fn open_conversation_persists_last_chat_open() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let chat = ChatFeed::new(uid(42), UnreadStrategy::FlagBased, DedupPolicy::default(), EventBus::new())
            .with_store(db.clone());
        assert_eq!(db.last_chat_open(uid(42)).unwrap(), None);
        chat.open_conversation(uid(7));
        assert!(db.last_chat_open(uid(42)).unwrap().is_some());
    }

    #[test]
    fn stale_presence_sync_is_ignored() {
        let chat = ChatFeed::new(uid(42), UnreadStrategy::FlagBased, DedupPolicy::default(), EventBus::new());
        chat.handle_presence(ChannelEvent::PresenceSync {
            seq: 2,
            online: [uid(1), uid(2)].into_iter().collect(),
        });
        chat.handle_presence(ChannelEvent::PresenceSync {
            seq: 1,
            online: [uid(3)].into_iter().collect(),
        });
        assert!(chat.is_online(uid(2)));
        assert!(!chat.is_online(uid(3)));
        assert_eq!(chat.online(), vec![uid(1), uid(2)]);
    }

    #[tokio::test]
    async fn commands_reach_the_feeds() {
        let bus = EventBus::new();
        let notifications = Arc::new(NotificationFeed::new(uid(42), DedupPolicy::default(), bus.clone()));
        let chat = Arc::new(ChatFeed::new(
            uid(42),
            UnreadStrategy::FlagBased,
            DedupPolicy::default(),
            bus.clone(),
        ));
        notifications.reset_to(3);
        chat.reset_to(uid(7), 2);

        let shutdown = CancellationToken::new();
        let mut events = bus.subscribe();
        let task = tokio::spawn(run_commands(
            bus.clone(),
            notifications.clone(),
            chat.clone(),
            shutdown.clone(),
        ));
        tokio::task::yield_now().await;

        bus.send_command(SyncCommand::ResetUnread(TallyKey::Notifications));
        bus.send_command(SyncCommand::OpenConversation(uid(7)));
        loop {
            if let Ok(SyncEvent::UnreadChanged {
                key: TallyKey::Conversation(_),
                ..
            }) = events.recv().await
            {
                break;
            }
        }
        assert_eq!(notifications.unread(), 0);
        assert_eq!(chat.unread(uid(7)), 0);
        assert_eq!(chat.active_conversation(), Some(uid(7)));

        shutdown.cancel();
        task.await.unwrap();
    }
}
