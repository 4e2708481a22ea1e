use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Numeric id of a platform user. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawId", into = "i64")]
pub struct UserId(i64);

impl UserId {
    /// Returns `None` for zero or negative ids.
    pub fn new(id: i64) -> Option<Self> {
        (id > 0).then_some(Self(id))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<UserId> for i64 {
    fn from(id: UserId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidUserId {
    #[error("user id is not a number: {0:?}")]
    NotNumeric(String),
    #[error("user id must be positive, got {0}")]
    NotPositive(i64),
}

impl FromStr for UserId {
    type Err = InvalidUserId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_matches('"');
        let raw: i64 = trimmed
            .parse()
            .map_err(|_| InvalidUserId::NotNumeric(s.to_string()))?;
        UserId::new(raw).ok_or(InvalidUserId::NotPositive(raw))
    }
}

/// Ids arrive as JSON numbers from the database service and as strings from
/// some REST endpoints.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Num(i64),
    Text(String),
}

impl TryFrom<RawId> for UserId {
    type Error = InvalidUserId;

    fn try_from(raw: RawId) -> Result<Self, Self::Error> {
        match raw {
            RawId::Num(n) => UserId::new(n).ok_or(InvalidUserId::NotPositive(n)),
            RawId::Text(s) => s.parse(),
        }
    }
}

/// Accepts either a JSON string or number and keeps it as a string.
pub fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match RawId::deserialize(deserializer)? {
        RawId::Num(n) => Ok(n.to_string()),
        RawId::Text(s) => Ok(s),
    }
}

/// A row of the `notifications` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRow {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    pub user_id: UserId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub seen: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A row of the `messages` table.
///
/// Deployments differ in how they mark a message as read: some carry a boolean
/// `seen` column, some a `seen_at` timestamp, some neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: i64,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl MessageRow {
    /// Read marker state, `None` when the row carries no read-marker column.
    pub fn is_read(&self) -> Option<bool> {
        match (self.seen, self.seen_at) {
            (Some(seen), _) => Some(seen),
            (None, Some(_)) => Some(true),
            (None, None) => None,
        }
    }

    /// The other side of the conversation from `me`'s point of view.
    pub fn counterpart(&self, me: UserId) -> UserId {
        if self.sender_id == me {
            self.receiver_id
        } else {
            self.sender_id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_rejects_non_positive() {
        assert!(UserId::new(0).is_none());
        assert!(UserId::new(-3).is_none());
        assert_eq!(UserId::new(42).map(UserId::get), Some(42));
        assert_eq!("0".parse::<UserId>(), Err(InvalidUserId::NotPositive(0)));
        assert!(matches!("abc".parse::<UserId>(), Err(InvalidUserId::NotNumeric(_))));
        assert_eq!("\"17\"".parse::<UserId>().map(UserId::get), Ok(17));
    }

    #[test]
    fn notification_row_accepts_numeric_and_string_ids() {
        let a: NotificationRow =
            serde_json::from_str(r#"{"id": 7, "user_id": "42", "message": "hi"}"#).unwrap();
        assert_eq!(a.id, "7");
        assert_eq!(a.user_id.get(), 42);
        assert!(!a.seen);

        let b: NotificationRow =
            serde_json::from_str(r#"{"id": "n1", "user_id": 42, "seen": true}"#).unwrap();
        assert_eq!(b.id, "n1");
        assert!(b.seen);
    }

    #[test]
    fn message_read_marker_variants() {
        let flag: MessageRow = serde_json::from_str(
            r#"{"id": 1, "sender_id": 2, "receiver_id": 3, "seen": false}"#,
        )
        .unwrap();
        assert_eq!(flag.is_read(), Some(false));

        let stamped: MessageRow = serde_json::from_str(
            r#"{"id": 1, "sender_id": 2, "receiver_id": 3, "seen_at": "2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(stamped.is_read(), Some(true));

        let bare: MessageRow =
            serde_json::from_str(r#"{"id": 1, "sender_id": 2, "receiver_id": 3}"#).unwrap();
        assert_eq!(bare.is_read(), None);
        assert_eq!(bare.counterpart(UserId::new(3).unwrap()).get(), 2);
    }
}
