//! Internal notification hook.
//!
//! Fetch and send failures are recovered silently as far as the view is
//! concerned. They are still reported here so a host can log, count, or show
//! a "disconnected" banner if it chooses to.

use serde::Serialize;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    SnapshotApplied {
        conversation_id: String,
        message_count: usize,
    },
    /// A poll result that arrived too late (after teardown) or out of order.
    SnapshotDiscarded {
        conversation_id: String,
        seq: u64,
    },
    FetchFailed {
        conversation_id: String,
        error: SyncError,
        consecutive_failures: u32,
    },
    /// Consecutive fetch failures reached the configured threshold.
    Disconnected {
        conversation_id: String,
        consecutive_failures: u32,
    },
    /// First successful fetch after a `Disconnected`.
    Reconnected {
        conversation_id: String,
    },
    SendDelivered {
        conversation_id: String,
    },
    SendFailed {
        conversation_id: String,
        error: SyncError,
    },
}

pub trait SyncObserver: Send + Sync + 'static {
    fn notify(&self, event: &SyncEvent);
}

impl<F> SyncObserver for F
where
    F: Fn(&SyncEvent) + Send + Sync + 'static,
{
    fn notify(&self, event: &SyncEvent) {
        self(event)
    }
}

/// Default observer: everything goes to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn notify(&self, event: &SyncEvent) {
        match event {
            SyncEvent::SnapshotApplied {
                conversation_id,
                message_count,
            } => {
                tracing::debug!(conversation_id = %conversation_id, message_count, "Snapshot applied");
            }
            SyncEvent::SnapshotDiscarded { conversation_id, seq } => {
                tracing::debug!(conversation_id = %conversation_id, seq, "Snapshot discarded");
            }
            SyncEvent::FetchFailed {
                conversation_id,
                error,
                consecutive_failures,
            } => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    consecutive_failures,
                    "Poll failed: {}", error
                );
            }
            SyncEvent::Disconnected {
                conversation_id,
                consecutive_failures,
            } => {
                tracing::error!(
                    conversation_id = %conversation_id,
                    consecutive_failures,
                    "Conversation store unreachable"
                );
            }
            SyncEvent::Reconnected { conversation_id } => {
                tracing::info!(conversation_id = %conversation_id, "Conversation store reachable again");
            }
            SyncEvent::SendDelivered { conversation_id } => {
                tracing::debug!(conversation_id = %conversation_id, "Message sent");
            }
            SyncEvent::SendFailed { conversation_id, error } => {
                tracing::warn!(conversation_id = %conversation_id, "Send failed: {}", error);
            }
        }
    }
}
