use reqwest::Method;
use serde_json::Value;
use tracing::{info, warn};

use jobhub_realtime::UnreadStrategy;
use jobhub_types::UserId;

use crate::client::ApiClient;
use crate::error::ApiError;

const READ_MARKER_COLUMNS: [&str; 2] = ["seen", "seen_at"];

impl ApiClient {
    /// Picks how unread messages are counted by looking at whether message
    /// rows carry a read-marker column. Asked once at startup.
    pub async fn negotiate_strategy(&self, me: UserId) -> Result<UnreadStrategy, ApiError> {
        let resp = self.send(self.request(Method::GET, "/messages/")?).await?;
        let body: Value = match resp.text().await.map(|t| serde_json::from_str(&t)) {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                warn!("Malformed message list while negotiating: {}", e);
                Value::Null
            }
            Err(e) => return Err(e.into()),
        };

        let strategy = match has_read_marker(&body) {
            Some(true) => UnreadStrategy::FlagBased,
            // No rows to look at: timestamps work whatever the schema is
            Some(false) | None => UnreadStrategy::TimestampBased {
                last_seen: self.store().last_chat_open(me)?,
            },
        };
        info!("Unread strategy: {:?}", strategy);
        Ok(strategy)
    }
}

/// `None` when the list has no rows to inspect.
fn has_read_marker(body: &Value) -> Option<bool> {
    let rows = match body {
        Value::Array(rows) => rows,
        Value::Object(page) => page.get("results")?.as_array()?,
        _ => return None,
    };
    let first = rows.first()?.as_object()?;
    Some(READ_MARKER_COLUMNS.iter().any(|c| first.contains_key(*c)))
}
