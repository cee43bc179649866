use serde_json::Value;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::models::OutgoingMessage;

// ============================================================================
// Collaborator trait
// ============================================================================

/// The two remote operations the synchronizer depends on.
///
/// `fetch` returns the raw decoded body; shape checking belongs to
/// [`normalize`](super::conversation::normalize).
#[async_trait::async_trait]
pub trait ConversationClient: Send + Sync + 'static {
    /// `GET {base}/chat/{conversation_id}`.
    async fn fetch(&self, conversation_id: &str) -> Result<Value, SyncError>;

    /// `POST {base}/chat/{conversation_id}`. Any response body is ignored.
    async fn send(&self, conversation_id: &str, message: &OutgoingMessage) -> Result<(), SyncError>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

fn fetch_err(e: impl std::fmt::Display) -> SyncError {
    SyncError::Fetch(e.to_string())
}

fn send_err(e: impl std::fmt::Display) -> SyncError {
    SyncError::Send(e.to_string())
}

/// `reqwest`-backed client for the conversation store.
pub struct HttpConversationClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpConversationClient {
    /// Build a client for `config.base_url` with `config.request_timeout`.
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SyncError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(http, &config.base_url))
    }

    /// Wrap an existing `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// The conversation id is a single path segment, so it is percent-encoded.
    fn chat_url(&self, conversation_id: &str) -> String {
        format!("{}/chat/{}", self.base_url, urlencoding::encode(conversation_id))
    }
}

#[async_trait::async_trait]
impl ConversationClient for HttpConversationClient {
    async fn fetch(&self, conversation_id: &str) -> Result<Value, SyncError> {
        self.http
            .get(self.chat_url(conversation_id))
            .send()
            .await
            .map_err(fetch_err)?
            .error_for_status()
            .map_err(fetch_err)?
            .json::<Value>()
            .await
            .map_err(fetch_err)
    }

    async fn send(&self, conversation_id: &str, message: &OutgoingMessage) -> Result<(), SyncError> {
        self.http
            .post(self.chat_url(conversation_id))
            .json(message)
            .send()
            .await
            .map_err(send_err)?
            .error_for_status()
            .map_err(send_err)?;
        Ok(())
    }
}
