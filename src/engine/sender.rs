use std::sync::Arc;

use super::client::ConversationClient;
use super::observer::{SyncEvent, SyncObserver};
use crate::error::SyncError;
use crate::models::OutgoingMessage;

/// Result of one dispatched send. Never fed back into the message list;
/// the next poll is the only source of truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Failed(SyncError),
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered)
    }
}

/// Best-effort, at-most-once sender. No retry, no queue.
pub struct MessageSender {
    client: Arc<dyn ConversationClient>,
    observer: Arc<dyn SyncObserver>,
    conversation_id: String,
}

impl MessageSender {
    pub fn new(
        client: Arc<dyn ConversationClient>,
        observer: Arc<dyn SyncObserver>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            observer,
            conversation_id: conversation_id.into(),
        }
    }

    /// Trim the draft into an outgoing message. `None` for blank input.
    pub fn prepare(draft: &str) -> Option<OutgoingMessage> {
        let text = draft.trim();
        if text.is_empty() {
            return None;
        }
        Some(OutgoingMessage {
            text: text.to_string(),
        })
    }

    /// Send once. Failures are logged and reported, never returned as `Err`.
    pub async fn dispatch(&self, message: OutgoingMessage) -> SendOutcome {
        match self.client.send(&self.conversation_id, &message).await {
            Ok(()) => {
                self.observer.notify(&SyncEvent::SendDelivered {
                    conversation_id: self.conversation_id.clone(),
                });
                SendOutcome::Delivered
            }
            Err(error) => {
                self.observer.notify(&SyncEvent::SendFailed {
                    conversation_id: self.conversation_id.clone(),
                    error: error.clone(),
                });
                SendOutcome::Failed(error)
            }
        }
    }
}

/// Runs its release closure exactly once when dropped, including when the
/// owning task is aborted or unwinds.
pub struct InFlightGuard<F: FnOnce()> {
    release: Option<F>,
}

impl<F: FnOnce()> InFlightGuard<F> {
    pub fn new(release: F) -> Self {
        Self {
            release: Some(release),
        }
    }
}

impl<F: FnOnce()> Drop for InFlightGuard<F> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}
