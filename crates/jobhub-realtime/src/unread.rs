use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use jobhub_types::{MessageRow, UserId};

/// What an unread badge counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TallyKey {
    Notifications,
    Conversation(UserId),
}

/// Per-key unread counts. Counts never go below zero.
#[derive(Debug, Default, Clone)]
pub struct UnreadTally {
    counts: HashMap<TallyKey, u32>,
}

impl UnreadTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: TallyKey) -> u32 {
        self.counts.get(&key).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, key: TallyKey) -> u32 {
        let count = self.counts.entry(key).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Clamped at zero.
    pub fn decrement(&mut self, key: TallyKey) -> u32 {
        match self.counts.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            _ => {
                self.counts.remove(&key);
                0
            }
        }
    }

    pub fn reset_to(&mut self, key: TallyKey, value: u32) {
        if value == 0 {
            self.counts.remove(&key);
        } else {
            self.counts.insert(key, value);
        }
    }

    /// Sum over all conversations (excluding the notification feed).
    pub fn total_conversations(&self) -> u32 {
        self.counts
            .iter()
            .filter(|(k, _)| matches!(k, TallyKey::Conversation(_)))
            .map(|(_, v)| *v)
            .sum()
    }

    /// Keys with a non-zero count.
    pub fn keys(&self) -> Vec<TallyKey> {
        self.counts.keys().copied().collect()
    }

    pub fn clear_conversations(&mut self) {
        self.counts.retain(|k, _| !matches!(k, TallyKey::Conversation(_)));
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}

/// How a message is judged unread. Chosen once at startup from what the
/// backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadStrategy {
    /// Rows carry a read marker.
    FlagBased,
    /// No read marker: anything received after `last_seen` is unread.
    TimestampBased { last_seen: Option<DateTime<Utc>> },
}

impl UnreadStrategy {
    pub fn is_unread(&self, row: &MessageRow, me: UserId) -> bool {
        if row.receiver_id != me {
            return false;
        }
        match self {
            Self::FlagBased => row.is_read() != Some(true),
            Self::TimestampBased { last_seen } => match (row.created_at, last_seen) {
                (Some(created), Some(seen)) => created > *seen,
                // Never opened the chat: everything received is unread
                (Some(_), None) => true,
                (None, _) => false,
            },
        }
    }
}

/// Chat unread bookkeeping for the signed-in user.
#[derive(Debug)]
pub struct UnreadCounter {
    me: UserId,
    strategy: UnreadStrategy,
    active: Option<UserId>,
    tally: UnreadTally,
    /// Message ids behind each conversation's count
    counted: HashMap<UserId, HashSet<i64>>,
}

impl UnreadCounter {
    pub fn new(me: UserId, strategy: UnreadStrategy) -> Self {
        Self {
            me,
            strategy,
            active: None,
            tally: UnreadTally::new(),
            counted: HashMap::new(),
        }
    }

    pub fn strategy(&self) -> UnreadStrategy {
        self.strategy
    }

    pub fn active(&self) -> Option<UserId> {
        self.active
    }

    pub fn get(&self, contact: UserId) -> u32 {
        self.tally.get(TallyKey::Conversation(contact))
    }

    pub fn total(&self) -> u32 {
        self.tally.total_conversations()
    }

    /// Seeds the tally from a fetched message list.
    pub fn recount(&mut self, rows: &[MessageRow]) {
        self.tally.clear_conversations();
        self.counted.clear();
        for row in rows {
            let contact = row.sender_id;
            if Some(contact) == self.active || !self.strategy.is_unread(row, self.me) {
                continue;
            }
            if self.counted.entry(contact).or_default().insert(row.id) {
                self.tally.increment(TallyKey::Conversation(contact));
            }
        }
    }

    /// New message pushed. Returns the new count if it was incremented.
    pub fn on_insert(&mut self, row: &MessageRow) -> Option<u32> {
        if row.receiver_id != self.me {
            return None;
        }
        let contact = row.sender_id;
        if Some(contact) == self.active {
            return None;
        }
        if !self.counted.entry(contact).or_default().insert(row.id) {
            return None;
        }
        Some(self.tally.increment(TallyKey::Conversation(contact)))
    }

    /// Message updated. Returns the new count if a message this counter
    /// counted is now marked read. Each counted message decrements once.
    pub fn on_update(&mut self, new: &MessageRow) -> Option<u32> {
        if self.strategy != UnreadStrategy::FlagBased || new.receiver_id != self.me {
            return None;
        }
        if new.is_read() != Some(true) {
            return None;
        }
        let contact = new.sender_id;
        let removed = self
            .counted
            .get_mut(&contact)
            .is_some_and(|ids| ids.remove(&new.id));
        if !removed {
            return None;
        }
        Some(self.tally.decrement(TallyKey::Conversation(contact)))
    }

    /// Makes `contact` the active conversation and zeroes its count.
    pub fn open_conversation(&mut self, contact: UserId) {
        self.active = Some(contact);
        self.tally.reset_to(TallyKey::Conversation(contact), 0);
        self.counted.remove(&contact);
    }

    pub fn close_conversation(&mut self) {
        self.active = None;
    }

    pub fn reset_to(&mut self, contact: UserId, value: u32) {
        self.tally.reset_to(TallyKey::Conversation(contact), value);
        if value == 0 {
            self.counted.remove(&contact);
        }
    }

    /// Conversations with a non-zero count.
    pub fn unread_contacts(&self) -> Vec<UserId> {
        self.tally
            .keys()
            .into_iter()
            .filter_map(|k| match k {
                TallyKey::Conversation(id) => Some(id),
                TallyKey::Notifications => None,
            })
            .collect()
    }

    /// Zeroes every conversation. Returns the keys that were non-zero.
    pub fn mark_all_read(&mut self, now: DateTime<Utc>) -> Vec<UserId> {
        let cleared = self.unread_contacts();
        self.tally.clear_conversations();
        self.counted.clear();
        if let UnreadStrategy::TimestampBased { last_seen } = &mut self.strategy {
            *last_seen = Some(now);
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn uid(n: i64) -> UserId {
        UserId::new(n).unwrap()
    }

    fn msg(id: i64, from: i64, to: i64) -> MessageRow {
        MessageRow {
            id,
            sender_id: uid(from),
            receiver_id: uid(to),
            content: format!("m{}", id),
            seen: Some(false),
            seen_at: None,
            created_at: Some(Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap()),
        }
    }

    #[test]
    fn tally_never_goes_negative() {
        let mut tally = UnreadTally::new();
        let key = TallyKey::Conversation(uid(5));
        assert_eq!(tally.decrement(key), 0);
        tally.increment(key);
        assert_eq!(tally.decrement(key), 0);
        assert_eq!(tally.decrement(key), 0);
        assert_eq!(tally.get(key), 0);

        // Arbitrary interleaving stays non-negative and consistent
        let ops = [1, 1, -1, -1, -1, 1, -1, 1, 1, 1, -1];
        let mut expected: i64 = 0;
        for op in ops {
            if op > 0 {
                tally.increment(key);
                expected += 1;
            } else {
                tally.decrement(key);
                expected = (expected - 1).max(0);
            }
            assert_eq!(tally.get(key) as i64, expected);
        }
    }

    #[test]
    fn reset_then_increment_yields_one() {
        let mut tally = UnreadTally::new();
        let key = TallyKey::Notifications;
        for _ in 0..4 {
            tally.increment(key);
        }
        tally.reset_to(key, 0);
        assert_eq!(tally.increment(key), 1);

        tally.increment(TallyKey::Conversation(uid(3)));
        tally.clear();
        assert!(tally.keys().is_empty());
    }

    #[test]
    fn inserts_count_only_outside_active_conversation() {
        let me = 42;
        let mut counter = UnreadCounter::new(uid(me), UnreadStrategy::FlagBased);
        counter.open_conversation(uid(7));

        for i in 0..3 {
            assert_eq!(counter.on_insert(&msg(i, 9, me)), Some(i as u32 + 1));
        }
        assert_eq!(counter.on_insert(&msg(10, 7, me)), None);
        // Own outgoing messages never count
        assert_eq!(counter.on_insert(&msg(11, me, 9)), None);

        assert_eq!(counter.get(uid(9)), 3);
        assert_eq!(counter.get(uid(7)), 0);
        assert_eq!(counter.total(), 3);
    }

    #[test]
    fn read_marker_transition_decrements_once() {
        let me = 42;
        let mut counter = UnreadCounter::new(uid(me), UnreadStrategy::FlagBased);
        counter.on_insert(&msg(1, 9, me));
        counter.on_insert(&msg(2, 9, me));

        let mut read = msg(1, 9, me);
        read.seen = Some(true);
        assert_eq!(counter.on_update(&read), Some(1));
        // Same message again: already accounted for
        assert_eq!(counter.on_update(&read), None);
        // Unread update: no transition
        assert_eq!(counter.on_update(&msg(2, 9, me)), None);
        assert_eq!(counter.get(uid(9)), 1);
    }

    #[test]
    fn editing_a_read_message_keeps_other_unread() {
        let me = 42;
        let mut counter = UnreadCounter::new(uid(me), UnreadStrategy::FlagBased);
        counter.on_insert(&msg(1, 7, me));
        counter.on_insert(&msg(2, 7, me));

        let mut read = msg(1, 7, me);
        read.seen = Some(true);
        assert_eq!(counter.on_update(&read), Some(1));

        read.content = "edited".into();
        assert_eq!(counter.on_update(&read), None);
        assert_eq!(counter.get(uid(7)), 1);
    }

    #[test]
    fn reading_a_message_received_while_open_keeps_later_unread() {
        let me = 42;
        let mut counter = UnreadCounter::new(uid(me), UnreadStrategy::FlagBased);
        counter.open_conversation(uid(7));
        assert_eq!(counter.on_insert(&msg(1, 7, me)), None);
        counter.close_conversation();
        assert_eq!(counter.on_insert(&msg(2, 7, me)), Some(1));

        let mut read = msg(1, 7, me);
        read.seen = Some(true);
        assert_eq!(counter.on_update(&read), None);
        assert_eq!(counter.get(uid(7)), 1);

        let mut read = msg(2, 7, me);
        read.seen = Some(true);
        assert_eq!(counter.on_update(&read), Some(0));
    }

    #[test]
    fn timestamp_strategy_counts_after_last_seen() {
        let me = 42;
        let last_seen = Utc.timestamp_opt(1_700_000_002, 0).unwrap();
        let mut counter = UnreadCounter::new(
            uid(me),
            UnreadStrategy::TimestampBased {
                last_seen: Some(last_seen),
            },
        );
        let rows: Vec<_> = (1..=5).map(|i| msg(i, 9, me)).collect();
        counter.recount(&rows);
        assert_eq!(counter.get(uid(9)), 3);

        // No read markers in this mode
        let mut read = msg(4, 9, me);
        read.seen = Some(true);
        assert_eq!(counter.on_update(&read), None);

        let now = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        assert_eq!(counter.mark_all_read(now), vec![uid(9)]);
        assert_eq!(counter.total(), 0);
        counter.recount(&rows);
        assert_eq!(counter.total(), 0);
    }

    #[test]
    fn flag_strategy_recount() {
        let me = 42;
        let mut counter = UnreadCounter::new(uid(me), UnreadStrategy::FlagBased);
        let mut rows = vec![msg(1, 9, me), msg(2, 9, me), msg(3, 8, me), msg(4, me, 8)];
        rows[0].seen = Some(true);
        counter.recount(&rows);
        assert_eq!(counter.get(uid(9)), 1);
        assert_eq!(counter.get(uid(8)), 1);

        // Only the seeded unread row decrements
        let mut read = msg(1, 9, me);
        read.seen = Some(true);
        assert_eq!(counter.on_update(&read), None);
        let mut read = msg(2, 9, me);
        read.seen = Some(true);
        assert_eq!(counter.on_update(&read), Some(0));
    }
}
