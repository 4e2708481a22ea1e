mod config;

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use jobhub_api::ApiClient;
use jobhub_realtime::feeds::run_commands;
use jobhub_realtime::{
    ChannelSubscriber, ChatFeed, EventBus, IdentitySource, NotificationFeed, StoredIdentity,
    SubscriptionHandle, SubscriptionStatus, SyncEvent, UnreadStrategy, WsTransport,
};
use jobhub_store::Database;

use crate::config::SyncConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobhub=debug".into()),
        )
        .init();

    let config = SyncConfig::from_env()?;
    let db = Arc::new(Database::open(&config.store_path)?);
    let identity = Arc::new(StoredIdentity::new(db.clone()));

    let Some(me) = identity.resolve() else {
        info!("Not signed in, nothing to sync");
        return Ok(());
    };
    info!("Syncing for user {}", me);

    // Seed local state from REST before the first push arrives
    let api = ApiClient::new(&config.api_url, db.clone());
    let strategy = match api.negotiate_strategy(me).await {
        Ok(strategy) => strategy,
        Err(e) => {
            warn!("Could not negotiate unread strategy, counting by timestamp: {}", e);
            UnreadStrategy::TimestampBased {
                last_seen: db.last_chat_open(me)?,
            }
        }
    };

    let bus = EventBus::new();
    let dedup = config.realtime.dedup.clone();
    let notifications = Arc::new(
        NotificationFeed::new(me, dedup.clone(), bus.clone()).with_identity(identity.clone()),
    );
    let chat = Arc::new(
        ChatFeed::new(me, strategy, dedup, bus.clone())
            .with_store(db.clone())
            .with_identity(identity.clone()),
    );
    let api = Arc::new(api);
    seed(&api, &notifications, &chat).await;

    let logger = tokio::spawn(log_events(bus.clone()));
    let resync = tokio::spawn(resync_on_identity_change(
        bus.clone(),
        api.clone(),
        notifications.clone(),
        chat.clone(),
    ));

    // Subscriptions
    let transport = WsTransport::new(&config.realtime_url, &config.api_key)?
        .with_heartbeat_interval(config.realtime.heartbeat_interval);
    let subscriber = ChannelSubscriber::new(transport, identity.clone(), config.realtime.clone());

    let feed = notifications.clone();
    let notification_sub = subscriber
        .open(NotificationFeed::channel_spec(), move |event| feed.handle(event))
        .await;
    let feed = chat.clone();
    let message_sub = subscriber
        .open(ChatFeed::messages_spec(), move |event| feed.handle_message(event))
        .await;
    let feed = chat.clone();
    let presence_sub = subscriber
        .open(ChatFeed::presence_spec(), move |event| feed.handle_presence(event))
        .await;

    let handles = vec![notification_sub, message_sub, presence_sub];
    for handle in &handles {
        forward_status(handle, &bus);
    }

    let shutdown = CancellationToken::new();
    let commands = tokio::spawn(run_commands(
        bus.clone(),
        notifications.clone(),
        chat.clone(),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    shutdown.cancel();
    for handle in handles {
        handle.close().await;
    }
    let _ = commands.await;
    resync.abort();
    logger.abort();

    Ok(())
}

/// Republishes a subscription's status changes on the bus.
fn forward_status(handle: &SubscriptionHandle, bus: &EventBus) {
    let purpose = handle.purpose();
    let mut status = handle.watch_status();
    let bus = bus.clone();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            bus.publish(SyncEvent::Status {
                purpose,
                status: current,
            });
        }
    });
}

/// Fetches the signed-in user's notifications and inbox into the feeds.
async fn seed(api: &ApiClient, notifications: &NotificationFeed, chat: &ChatFeed) {
    match api.notifications().await {
        Ok(rows) => notifications.seed(&rows),
        Err(e) => warn!("Failed to fetch notifications: {}", e),
    }
    match api.inbox().await {
        Ok(rows) => chat.seed(&rows),
        Err(e) => warn!("Failed to fetch messages: {}", e),
    }
}

/// Re-checks the identity whenever a subscription comes up, and reseeds both
/// feeds from REST once per new identity.
async fn resync_on_identity_change(
    bus: EventBus,
    api: Arc<ApiClient>,
    notifications: Arc<NotificationFeed>,
    chat: Arc<ChatFeed>,
) {
    let mut events = bus.subscribe();
    let mut seeded_for = notifications.refresh_identity();
    loop {
        match events.recv().await {
            Ok(SyncEvent::Status {
                status: SubscriptionStatus::Subscribed,
                ..
            }) => {
                notifications.refresh_identity();
                chat.refresh_identity();
            }
            Ok(SyncEvent::IdentityChanged { identity }) if seeded_for != Some(identity) => {
                info!("Reseeding for user {}", identity);
                seeded_for = Some(identity);
                notifications.refresh_identity();
                chat.refresh_identity();
                seed(&api, &notifications, &chat).await;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!("Resync lagged, {} events dropped", n),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn log_events(bus: EventBus) {
    let mut events = bus.subscribe();
    loop {
        match events.recv().await {
            Ok(SyncEvent::Toast { title, body }) => info!("[toast] {}: {}", title, body),
            Ok(SyncEvent::UnreadChanged { key, count }) => debug!("Unread {:?} = {}", key, count),
            Ok(SyncEvent::PresenceChanged { online }) => debug!("{} users online", online),
            Ok(SyncEvent::Status { purpose, status }) => info!("{} subscription {}", purpose, status),
            Ok(SyncEvent::IdentityChanged { identity }) => info!("Now syncing for user {}", identity),
            Err(RecvError::Lagged(n)) => warn!("Event log lagged, {} events dropped", n),
            Err(RecvError::Closed) => break,
        }
    }
}
