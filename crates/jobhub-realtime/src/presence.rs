use std::collections::BTreeSet;

use jobhub_types::UserId;
use jobhub_types::events::PresenceState;

/// Who is online, as of the newest presence sync.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: BTreeSet<UserId>,
    last_seq: Option<u64>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the set wholesale. Syncs not newer than the last applied one
    /// are ignored. Returns whether the sync was applied.
    pub fn apply_sync(&mut self, seq: u64, online: BTreeSet<UserId>) -> bool {
        if self.last_seq.is_some_and(|last| seq <= last) {
            return false;
        }
        self.last_seq = Some(seq);
        self.online = online;
        true
    }

    pub fn is_online(&self, id: UserId) -> bool {
        self.online.contains(&id)
    }

    pub fn online(&self) -> Vec<UserId> {
        self.online.iter().copied().collect()
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    /// Forgets who is online. Sequence numbers keep rising across channels,
    /// so the last applied one is kept.
    pub fn clear(&mut self) {
        self.online.clear();
    }
}

/// Identities present in a full presence state. Keys are the tracked user
/// ids; metas are consulted for keys that are not numeric.
pub fn online_set(state: &PresenceState) -> BTreeSet<UserId> {
    let mut online = BTreeSet::new();
    for (key, entry) in state {
        match key.parse::<UserId>() {
            Ok(id) => {
                online.insert(id);
            }
            Err(_) => online.extend(entry.metas.iter().filter_map(|m| m.user_id)),
        }
    }
    online
}
