use tokio::sync::broadcast;

use jobhub_types::UserId;

use crate::channel::Purpose;
use crate::reconnect::SubscriptionStatus;
use crate::unread::TallyKey;

/// Something the UI should reflect.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Toast { title: String, body: String },
    UnreadChanged { key: TallyKey, count: u32 },
    PresenceChanged { online: usize },
    Status { purpose: Purpose, status: SubscriptionStatus },
    /// A feed dropped the previous user's state and now follows `identity`.
    IdentityChanged { identity: UserId },
}

/// Something the UI asks the sync layer to do.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncCommand {
    ResetUnread(TallyKey),
    OpenConversation(UserId),
    CloseConversation,
    MarkAllRead,
}

/// Shared bus between the sync layer and whatever renders it. Cloning is
/// cheap; all clones share the same channels.
#[derive(Clone)]
pub struct EventBus {
    events: broadcast::Sender<SyncEvent>,
    commands: broadcast::Sender<SyncCommand>,
}

impl EventBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        let (commands, _) = broadcast::channel(64);
        Self { events, commands }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Publish to every subscriber. Nobody listening is fine.
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe_commands(&self) -> broadcast::Receiver<SyncCommand> {
        self.commands.subscribe()
    }

    pub fn send_command(&self, command: SyncCommand) {
        let _ = self.commands.send(command);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
