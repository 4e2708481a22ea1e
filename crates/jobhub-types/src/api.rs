use serde::{Deserialize, Serialize};

use crate::models::{MessageRow, NotificationRow, UserId};

// -- Notifications --

/// The notifications endpoint answers with either a bare list or a paginated
/// envelope depending on the backend version.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum NotificationList {
    Page { results: Vec<NotificationRow> },
    Plain(Vec<NotificationRow>),
}

impl NotificationList {
    pub fn into_rows(self) -> Vec<NotificationRow> {
        match self {
            Self::Page { results } => results,
            Self::Plain(rows) => rows,
        }
    }
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageList {
    Page { results: Vec<MessageRow> },
    Plain(Vec<MessageRow>),
}

impl MessageList {
    pub fn into_rows(self) -> Vec<MessageRow> {
        match self {
            Self::Page { results } => results,
            Self::Plain(rows) => rows,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SendMessageRequest {
    pub receiver_id: UserId,
    pub content: String,
}

/// Body of a mark-as-read update.
#[derive(Debug, Serialize)]
pub struct ReadMarkerUpdate {
    pub seen: bool,
}

// -- Users --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl UserProfile {
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{} {}", first, last),
            (Some(first), None) => first.clone(),
            _ => self.username.clone(),
        }
    }
}
