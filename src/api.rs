// REST collaborator for chat history, unread counters and read receipts

use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::models::Message;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Conversation history between `user_id` and `contact_id` in `context`.
    async fn fetch_messages(
        &self,
        user_id: &str,
        contact_id: &str,
        context: &str,
    ) -> Result<Vec<Message>, ApiError>;

    /// Unread counters for `user_id`, keyed by sender id.
    async fn fetch_unread_counts(&self, user_id: &str) -> Result<HashMap<String, u32>, ApiError>;

    /// Mark every message from `sender_id` to `receiver_id` as read.
    async fn mark_as_read(&self, receiver_id: &str, sender_id: &str) -> Result<(), ApiError>;
}

/// `ChatApi` over plain HTTP/JSON.
pub struct HttpChatApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpChatApi {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(HttpChatApi {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(ApiError::Status {
                status: status.as_u16(),
                url: response.url().to_string(),
            })
        }
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_messages(
        &self,
        user_id: &str,
        contact_id: &str,
        context: &str,
    ) -> Result<Vec<Message>, ApiError> {
        let url = self.url(&format!("messages/{}/{}", user_id, contact_id));
        debug!("GET {} (context {})", url, context);
        let response = self
            .client
            .get(&url)
            .query(&[("context", context)])
            .send()
            .await?;
        Ok(Self::check(response)?.json::<Vec<Message>>().await?)
    }

    async fn fetch_unread_counts(&self, user_id: &str) -> Result<HashMap<String, u32>, ApiError> {
        let url = self.url(&format!("messages/unread/{}", user_id));
        debug!("GET {}", url);
        let response = self.client.get(&url).send().await?;
        Ok(Self::check(response)?
            .json::<HashMap<String, u32>>()
            .await?)
    }

    async fn mark_as_read(&self, receiver_id: &str, sender_id: &str) -> Result<(), ApiError> {
        let url = self.url("messages/read");
        debug!("PUT {} ({} <- {})", url, receiver_id, sender_id);
        let response = self
            .client
            .put(&url)
            .query(&[("receiverId", receiver_id), ("senderId", sender_id)])
            .send()
            .await?;
        Self::check(response)?;
        Ok(())
    }
}
