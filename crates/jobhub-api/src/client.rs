use std::sync::Arc;

use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use jobhub_store::Database;

use crate::error::ApiError;

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    store: Arc<Database>,
}

impl ApiClient {
    /// `base_url` is the API root, e.g. `https://api.example.com/api`.
    pub fn new(base_url: &str, store: Arc<Database>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            store,
        }
    }

    pub fn store(&self) -> &Arc<Database> {
        &self.store
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// A request with the stored bearer token attached.
    pub(crate) fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let token = self.store.access_token()?.ok_or(ApiError::NoToken)?;
        Ok(self
            .http
            .request(method, self.url(path))
            .header("Authorization", format!("Bearer {}", token)))
    }

    /// Sends and turns non-success statuses into errors.
    pub(crate) async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        Ok(resp)
    }

    /// GETs a list body, defaulting to empty when it does not parse.
    pub(crate) async fn get_list<L, T>(&self, path: &str, into_rows: fn(L) -> Vec<T>) -> Result<Vec<T>, ApiError>
    where
        L: DeserializeOwned,
    {
        let resp = self.send(self.request(Method::GET, path)?).await?;
        let body = resp.text().await?;
        match serde_json::from_str::<L>(&body) {
            Ok(list) => {
                let rows = into_rows(list);
                debug!("GET {} -> {} rows", path, rows.len());
                Ok(rows)
            }
            Err(e) => {
                warn!("Malformed list from {}: {}", path, e);
                Ok(Vec::new())
            }
        }
    }
}
