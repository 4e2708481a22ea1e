use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use tracing::warn;

use jobhub_types::UserId;

use crate::Database;
use crate::models::StorageKey;

const DEFAULT_LANGUAGE: &str = "en";

impl Database {
    // -- Raw key/value --

    pub fn get(&self, key: StorageKey) -> Result<Option<String>> {
        self.with_conn(|conn| query_value(conn, &key.as_str()))
    }

    pub fn set(&self, key: StorageKey, value: &str) -> Result<()> {
        let key = key.as_str();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                (&*key, value),
            )?;
            Ok(())
        })
    }

    pub fn remove(&self, key: StorageKey) -> Result<()> {
        let key = key.as_str();
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", [&*key])?;
            Ok(())
        })
    }

    // -- Session --

    pub fn access_token(&self) -> Result<Option<String>> {
        Ok(self.get(StorageKey::AccessToken)?.filter(|t| !t.is_empty()))
    }

    /// Persisted user id, checking `user_id` first and `userId` second.
    /// Unparseable or non-positive values are skipped.
    pub fn stored_user_id(&self) -> Result<Option<UserId>> {
        for key in [StorageKey::UserId, StorageKey::UserIdLegacy] {
            let Some(raw) = self.get(key)? else {
                continue;
            };
            match raw.parse::<UserId>() {
                Ok(id) => return Ok(Some(id)),
                Err(e) => warn!("Ignoring stored {}: {}", key.as_str(), e),
            }
        }
        Ok(None)
    }

    /// Identity fallback chain: in-memory session value, then the persisted
    /// keys. Storage failures count as "no identity".
    pub fn resolve_identity(&self, session: Option<UserId>) -> Option<UserId> {
        if session.is_some() {
            return session;
        }
        self.stored_user_id().unwrap_or_else(|e| {
            warn!("Failed to read stored user id: {}", e);
            None
        })
    }

    /// Clears everything tied to the signed-in user.
    pub fn sign_out(&self) -> Result<()> {
        self.remove(StorageKey::AccessToken)?;
        self.remove(StorageKey::UserId)?;
        self.remove(StorageKey::UserIdLegacy)
    }

    // -- Chat --

    pub fn last_chat_open(&self, user: UserId) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.get(StorageKey::LastChatOpen(user))? else {
            return Ok(None);
        };
        let parsed = parse_timestamp(&raw);
        if parsed.is_none() {
            warn!("Ignoring malformed last chat open timestamp {:?} for {}", raw, user);
        }
        Ok(parsed)
    }

    pub fn set_last_chat_open(&self, user: UserId, at: DateTime<Utc>) -> Result<()> {
        // Epoch millis, the format the web client writes
        self.set(StorageKey::LastChatOpen(user), &at.timestamp_millis().to_string())
    }

    // -- Preferences --

    pub fn language(&self) -> Result<String> {
        Ok(self
            .get(StorageKey::Language)?
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()))
    }

    pub fn set_language(&self, language: &str) -> Result<()> {
        self.set(StorageKey::Language, language)
    }
}

fn query_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
        .optional()?;
    Ok(value)
}

/// Accepts epoch millis or RFC 3339.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(millis) = raw.trim().parse::<i64>() {
        return Utc.timestamp_millis_opt(millis).single();
    }
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
