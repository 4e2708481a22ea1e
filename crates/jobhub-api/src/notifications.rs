use reqwest::Method;
use tracing::info;

use jobhub_types::NotificationRow;
use jobhub_types::api::NotificationList;

use crate::client::ApiClient;
use crate::error::ApiError;

impl ApiClient {
    pub async fn notifications(&self) -> Result<Vec<NotificationRow>, ApiError> {
        self.get_list("/notifications/", NotificationList::into_rows).await
    }

    pub async fn delete_all_notifications(&self) -> Result<(), ApiError> {
        self.send(self.request(Method::DELETE, "/notifications/delete-all/")?)
            .await?;
        info!("Deleted all notifications");
        Ok(())
    }
}
