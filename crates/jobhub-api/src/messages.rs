use reqwest::Method;
use tracing::debug;

use jobhub_types::api::{MessageList, ReadMarkerUpdate, SendMessageRequest};
use jobhub_types::{MessageRow, UserId};

use crate::client::ApiClient;
use crate::error::ApiError;

impl ApiClient {
    /// Recent messages across all conversations.
    pub async fn inbox(&self) -> Result<Vec<MessageRow>, ApiError> {
        self.get_list("/messages/", MessageList::into_rows).await
    }

    /// The conversation with `contact`.
    pub async fn messages_with(&self, contact: UserId) -> Result<Vec<MessageRow>, ApiError> {
        self.get_list(&format!("/messages/?contact={}", contact), MessageList::into_rows)
            .await
    }

    pub async fn send_message(&self, receiver: UserId, content: &str) -> Result<MessageRow, ApiError> {
        let body = SendMessageRequest {
            receiver_id: receiver,
            content: content.to_string(),
        };
        let resp = self
            .send(self.request(Method::POST, "/messages/")?.json(&body))
            .await?;
        let text = resp.text().await?;
        let row: MessageRow = serde_json::from_str(&text).map_err(|e| ApiError::Malformed(e.to_string()))?;
        debug!("Sent message {} to {}", row.id, receiver);
        Ok(row)
    }

    /// Sets the read marker on one message.
    pub async fn mark_read(&self, message_id: i64) -> Result<(), ApiError> {
        let path = format!("/messages/{}/", message_id);
        self.send(
            self.request(Method::PATCH, &path)?
                .json(&ReadMarkerUpdate { seen: true }),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_message(&self, message_id: i64) -> Result<(), ApiError> {
        let path = format!("/messages/{}/", message_id);
        self.send(self.request(Method::DELETE, &path)?).await?;
        Ok(())
    }
}
