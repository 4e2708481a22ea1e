use reqwest::Method;

use jobhub_types::UserId;
use jobhub_types::api::UserProfile;

use crate::client::ApiClient;
use crate::error::ApiError;

impl ApiClient {
    pub async fn user_profile(&self, id: UserId) -> Result<UserProfile, ApiError> {
        let path = format!("/users/{}/", id);
        let resp = self.send(self.request(Method::GET, &path)?).await?;
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| ApiError::Malformed(e.to_string()))
    }
}
