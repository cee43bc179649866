use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::client::ConversationClient;
use super::conversation::{normalize, OrderedMessages};
use super::observer::{SyncEvent, SyncObserver};
use crate::error::SyncError;

// =============================================================================
// Backoff
// =============================================================================

/// Delay between poll ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Poll every interval regardless of failures.
    #[default]
    Fixed,
    /// Double the interval per consecutive failure, up to `max_ms`.
    Exponential { max_ms: u64 },
}

impl BackoffPolicy {
    pub fn delay(&self, interval: Duration, consecutive_failures: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed => interval,
            BackoffPolicy::Exponential { max_ms } => {
                let factor = 1u32 << consecutive_failures.min(16);
                let cap = Duration::from_millis(*max_ms).max(interval);
                interval.saturating_mul(factor).min(cap)
            }
        }
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Live counters, shared between the loop and its fetch tasks.
#[derive(Debug, Default)]
pub struct PollerState {
    fetches_issued: AtomicU64,
    fetches_applied: AtomicU64,
    fetches_failed: AtomicU64,
    fetches_discarded: AtomicU64,
    consecutive_failures: AtomicU32,
}

impl PollerState {
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PollerStats {
        PollerStats {
            fetches_issued: self.fetches_issued.load(Ordering::Relaxed),
            fetches_applied: self.fetches_applied.load(Ordering::Relaxed),
            fetches_failed: self.fetches_failed.load(Ordering::Relaxed),
            fetches_discarded: self.fetches_discarded.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollerStats {
    pub fetches_issued: u64,
    pub fetches_applied: u64,
    pub fetches_failed: u64,
    pub fetches_discarded: u64,
    pub consecutive_failures: u32,
}

// =============================================================================
// Snapshot delivery
// =============================================================================

/// One successfully fetched and normalized snapshot. `seq` increases with
/// issue order, not completion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledSnapshot {
    pub seq: u64,
    pub messages: OrderedMessages,
}

/// Receiver of polled snapshots. Returns `false` when the snapshot was not
/// applied (the owner has been torn down, or the response is stale).
pub trait SnapshotSink: Send + Sync + 'static {
    fn deliver(&self, snapshot: PolledSnapshot) -> bool;
}

impl<F> SnapshotSink for F
where
    F: Fn(PolledSnapshot) -> bool + Send + Sync + 'static,
{
    fn deliver(&self, snapshot: PolledSnapshot) -> bool {
        self(snapshot)
    }
}

// =============================================================================
// Poller
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub backoff: BackoffPolicy,
    /// `0` disables disconnect reporting.
    pub disconnect_threshold: u32,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::Fixed,
            disconnect_threshold: crate::config::DEFAULT_DISCONNECT_THRESHOLD,
        }
    }
}

/// Fixed-interval fetch loop over a [`ConversationClient`].
pub struct Poller {
    client: Arc<dyn ConversationClient>,
    observer: Arc<dyn SyncObserver>,
    options: PollOptions,
    state: Arc<PollerState>,
}

struct PollContext {
    conversation_id: String,
    client: Arc<dyn ConversationClient>,
    observer: Arc<dyn SyncObserver>,
    sink: Box<dyn SnapshotSink>,
    options: PollOptions,
    state: Arc<PollerState>,
    cancel: CancellationToken,
}

impl Poller {
    pub fn new(
        client: Arc<dyn ConversationClient>,
        observer: Arc<dyn SyncObserver>,
        options: PollOptions,
    ) -> Self {
        Self {
            client,
            observer,
            options,
            state: Arc::new(PollerState::default()),
        }
    }

    pub fn stats(&self) -> PollerStats {
        self.state.stats()
    }

    /// Fetch once immediately, then every `interval` until the returned
    /// handle is stopped or dropped.
    ///
    /// Each tick spawns its own fetch; a slow response does not delay the
    /// next tick. Must be called from within a tokio runtime.
    pub fn start(
        &self,
        conversation_id: impl Into<String>,
        interval: Duration,
        on_snapshot: impl SnapshotSink,
    ) -> Result<PollerHandle, SyncError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::Lifecycle(format!("poller needs a tokio runtime: {}", e)))?;
        if interval.is_zero() {
            return Err(SyncError::Config("poll interval must be greater than zero".into()));
        }

        let cancel = CancellationToken::new();
        let ctx = Arc::new(PollContext {
            conversation_id: conversation_id.into(),
            client: self.client.clone(),
            observer: self.observer.clone(),
            sink: Box::new(on_snapshot),
            options: self.options,
            state: self.state.clone(),
            cancel: cancel.clone(),
        });

        tracing::info!(
            conversation_id = %ctx.conversation_id,
            interval_ms = interval.as_millis() as u64,
            backoff = ?ctx.options.backoff,
            "Poller starting"
        );
        runtime.spawn(run_loop(ctx, interval));

        Ok(PollerHandle { cancel })
    }
}

/// Stops the poll loop on [`stop`](PollerHandle::stop) or drop.
#[derive(Debug)]
pub struct PollerHandle {
    cancel: CancellationToken,
}

impl PollerHandle {
    /// Idempotent. In-flight fetches complete into nothing.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            tracing::debug!("Poller stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_loop(ctx: Arc<PollContext>, interval: Duration) {
    let mut seq: u64 = 0;
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        seq += 1;
        ctx.state.fetches_issued.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(fetch_once(ctx.clone(), seq));

        let delay = ctx
            .options
            .backoff
            .delay(interval, ctx.state.consecutive_failures());
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::info!(conversation_id = %ctx.conversation_id, "Poll loop exited");
}

async fn fetch_once(ctx: Arc<PollContext>, seq: u64) {
    let result = tokio::select! {
        _ = ctx.cancel.cancelled() => {
            discard(&ctx, seq);
            return;
        }
        result = ctx.client.fetch(&ctx.conversation_id) => result,
    };

    // The result may have resolved in the same instant as teardown.
    if ctx.cancel.is_cancelled() {
        discard(&ctx, seq);
        return;
    }

    match result.and_then(|body| normalize(&body)) {
        Ok(messages) => {
            record_success(&ctx);
            let message_count = messages.len();
            if ctx.sink.deliver(PolledSnapshot { seq, messages }) {
                ctx.state.fetches_applied.fetch_add(1, Ordering::Relaxed);
                ctx.observer.notify(&SyncEvent::SnapshotApplied {
                    conversation_id: ctx.conversation_id.clone(),
                    message_count,
                });
            } else {
                discard(&ctx, seq);
            }
        }
        Err(error) => record_failure(&ctx, error),
    }
}

fn discard(ctx: &PollContext, seq: u64) {
    ctx.state.fetches_discarded.fetch_add(1, Ordering::Relaxed);
    ctx.observer.notify(&SyncEvent::SnapshotDiscarded {
        conversation_id: ctx.conversation_id.clone(),
        seq,
    });
}

fn record_success(ctx: &PollContext) {
    let previous = ctx.state.consecutive_failures.swap(0, Ordering::Relaxed);
    let threshold = ctx.options.disconnect_threshold;
    if threshold > 0 && previous >= threshold {
        ctx.observer.notify(&SyncEvent::Reconnected {
            conversation_id: ctx.conversation_id.clone(),
        });
    }
}

fn record_failure(ctx: &PollContext, error: SyncError) {
    ctx.state.fetches_failed.fetch_add(1, Ordering::Relaxed);
    let consecutive = ctx.state.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;

    ctx.observer.notify(&SyncEvent::FetchFailed {
        conversation_id: ctx.conversation_id.clone(),
        error,
        consecutive_failures: consecutive,
    });

    let threshold = ctx.options.disconnect_threshold;
    if threshold > 0 && consecutive == threshold {
        ctx.observer.notify(&SyncEvent::Disconnected {
            conversation_id: ctx.conversation_id.clone(),
            consecutive_failures: consecutive,
        });
    }
}
