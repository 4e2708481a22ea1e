use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic used for socket-level heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

// -- Frame events --

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";
pub const EVENT_PRESENCE: &str = "presence";
pub const EVENT_PRESENCE_STATE: &str = "presence_state";
pub const EVENT_PRESENCE_DIFF: &str = "presence_diff";
pub const EVENT_SYSTEM: &str = "system";

/// One frame on the realtime socket, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl Frame {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: None,
        }
    }

    pub fn with_ref(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn heartbeat(reference: impl Into<String>) -> Self {
        Frame::new(PHOENIX_TOPIC, EVENT_HEARTBEAT, Value::Object(Default::default()))
            .with_ref(reference)
    }

    /// Status of a `phx_reply`, e.g. `"ok"` or `"error"`.
    pub fn reply_status(&self) -> Option<&str> {
        if self.event != EVENT_REPLY {
            return None;
        }
        self.payload.get("status").and_then(Value::as_str)
    }
}

// -- Row changes --

/// Kind of row change pushed by the database service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Which change kinds a filter asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeSelector {
    #[serde(rename = "*")]
    All,
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

/// A `postgres_changes` entry of a join request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub event: ChangeSelector,
    pub schema: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Untyped change as it arrives in a `postgres_changes` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub record: Value,
    #[serde(default)]
    pub old_record: Value,
    #[serde(default)]
    pub commit_timestamp: Option<String>,
}

impl RawChange {
    /// Extracts the change from a `postgres_changes` payload, which nests it
    /// under `data`.
    pub fn from_payload(payload: &Value) -> Result<Self, ChangeError> {
        let data = payload.get("data").ok_or(ChangeError::MissingData)?;
        serde_json::from_value(data.clone()).map_err(|e| ChangeError::Malformed(e.to_string()))
    }

    /// Row id from the new record, falling back to the old one for deletes.
    pub fn row_id(&self) -> Option<String> {
        [&self.record, &self.old_record]
            .into_iter()
            .filter_map(|row| row.get("id"))
            .find_map(|id| match id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    pub fn event_key(&self) -> EventKey {
        EventKey {
            kind: self.kind,
            table: self.table.clone(),
            row_id: self.row_id().unwrap_or_default(),
            commit_timestamp: self.commit_timestamp.clone(),
        }
    }

    /// Parses the change into a typed row change for table row type `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<RowChange<T>, ChangeError> {
        match self.kind {
            ChangeKind::Insert => Ok(RowChange::Insert {
                new: parse_row(&self.record)?,
            }),
            ChangeKind::Update => Ok(RowChange::Update {
                new: parse_row(&self.record)?,
                old: parse_partial(&self.old_record),
            }),
            ChangeKind::Delete => Ok(RowChange::Delete {
                id: self.row_id(),
                old: parse_partial(&self.old_record),
            }),
        }
    }
}

fn parse_row<T: DeserializeOwned>(row: &Value) -> Result<T, ChangeError> {
    if row.is_null() {
        return Err(ChangeError::MissingRecord);
    }
    serde_json::from_value(row.clone()).map_err(|e| ChangeError::Malformed(e.to_string()))
}

/// Old records only carry the primary key unless the table has full replica
/// identity, so a failed parse just means "not available".
fn parse_partial<T: DeserializeOwned>(row: &Value) -> Option<T> {
    match row {
        Value::Object(map) if !map.is_empty() => serde_json::from_value(row.clone()).ok(),
        _ => None,
    }
}

/// Typed row change for one table.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange<T> {
    Insert { new: T },
    Update { new: T, old: Option<T> },
    Delete { id: Option<String>, old: Option<T> },
}

impl<T> RowChange<T> {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert { .. } => ChangeKind::Insert,
            Self::Update { .. } => ChangeKind::Update,
            Self::Delete { .. } => ChangeKind::Delete,
        }
    }
}

/// Identity of a pushed change, used to suppress redeliveries. An insert and a
/// later update of the same row have different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub kind: ChangeKind,
    pub table: String,
    pub row_id: String,
    pub commit_timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChangeError {
    #[error("postgres_changes payload has no data")]
    MissingData,
    #[error("change has no record")]
    MissingRecord,
    #[error("malformed change: {0}")]
    Malformed(String),
}

// -- Presence --

/// Metadata announced with `track`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    #[serde(default)]
    pub phx_ref: Option<String>,
    #[serde(default)]
    pub user_id: Option<crate::UserId>,
    #[serde(default)]
    pub online_at: Option<String>,
}

/// Full presence state: presence key -> metas.
pub type PresenceState = HashMap<String, PresenceEntry>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceEntry {
    #[serde(default)]
    pub metas: Vec<PresenceMeta>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceDiff {
    #[serde(default)]
    pub joins: PresenceState,
    #[serde(default)]
    pub leaves: PresenceState,
}

/// Applies a diff to a full state the way the hosted presence client does:
/// leaves remove the listed metas, a key with no metas left disappears, joins
/// add metas.
pub fn apply_presence_diff(state: &mut PresenceState, diff: PresenceDiff) {
    for (key, left) in diff.leaves {
        if let Some(entry) = state.get_mut(&key) {
            entry
                .metas
                .retain(|m| !left.metas.iter().any(|l| l.phx_ref == m.phx_ref));
            if entry.metas.is_empty() || left.metas.is_empty() {
                state.remove(&key);
            }
        }
    }
    for (key, joined) in diff.joins {
        let entry = state.entry(key).or_default();
        for meta in joined.metas {
            if !entry.metas.iter().any(|m| m.phx_ref == meta.phx_ref && meta.phx_ref.is_some()) {
                entry.metas.push(meta);
            }
        }
    }
}
