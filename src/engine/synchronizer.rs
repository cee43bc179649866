//! Composition root: owns the widget's live state and wires the poller,
//! sender and normalizer together.
//!
//! Lifecycle is `Idle → Polling → Stopped`, with `send_in_flight` as an
//! orthogonal flag. All mutation goes through one `std::sync::Mutex` that is
//! never held across an await; every mutation path re-checks the phase under
//! that lock, so no snapshot, draft or echo change lands after
//! [`Synchronizer::unmount`] returns. Only the in-flight flag is still
//! released by a send that completes later.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::client::{ConversationClient, HttpConversationClient};
use super::conversation::{order, OrderedMessages};
use super::observer::{SyncObserver, TracingObserver};
use super::poller::{PollOptions, PolledSnapshot, Poller, PollerHandle, PollerStats};
use super::sender::{InFlightGuard, MessageSender, SendOutcome};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::models::{ChatRole, ConversationView, Message, SyncPhase};

// =============================================================================
// Input
// =============================================================================

/// A key event from the view, using DOM `KeyboardEvent.key` names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPress {
    pub key: String,
    pub shift: bool,
    pub ctrl: bool,
    pub alt: bool,
    pub meta: bool,
}

impl KeyPress {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn enter() -> Self {
        Self::new("Enter")
    }

    pub fn with_shift(mut self) -> Self {
        self.shift = true;
        self
    }

    /// Enter with no modifier submits; Shift+Enter and friends do not.
    pub fn is_submit(&self) -> bool {
        self.key == "Enter" && !(self.shift || self.ctrl || self.alt || self.meta)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Draft is blank after trimming.
    Empty,
    /// A previous send has not finished.
    InFlight,
    /// The synchronizer has been unmounted.
    Stopped,
    /// Called outside a tokio runtime.
    NoRuntime,
}

#[derive(Debug)]
pub enum Submission {
    Ignored(IgnoreReason),
    Dispatched(JoinHandle<SendOutcome>),
}

impl Submission {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, Submission::Dispatched(_))
    }

    /// Wait for the network call. `None` if nothing was dispatched or the
    /// task was aborted.
    pub async fn outcome(self) -> Option<SendOutcome> {
        match self {
            Submission::Ignored(_) => None,
            Submission::Dispatched(handle) => handle.await.ok(),
        }
    }
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Default)]
struct ConversationState {
    /// Latest applied snapshot, replaced wholesale.
    messages: OrderedMessages,
    /// Local copies of sent text. Only used with `optimistic_echo`.
    echoes: Vec<Echo>,
    draft: String,
    send_in_flight: bool,
    phase: SyncPhase,
    last_applied_seq: u64,
    poller: Option<PollerHandle>,
}

/// A locally shown copy of a sent message.
#[derive(Debug)]
struct Echo {
    message: Message,
    /// Highest poll sequence issued when the send was delivered. Only a
    /// snapshot issued after that can contain the stored copy, so the echo
    /// survives every snapshot up to and including this one. `None` while
    /// the send is pending.
    delivered_at_seq: Option<u64>,
}

impl Echo {
    fn superseded_by(&self, seq: u64) -> bool {
        self.delivered_at_seq.is_some_and(|delivered| seq > delivered)
    }
}

impl ConversationState {
    fn view(&self) -> ConversationView {
        let messages = if self.echoes.is_empty() {
            self.messages.as_slice().to_vec()
        } else {
            order(
                self.messages
                    .iter()
                    .chain(self.echoes.iter().map(|echo| &echo.message))
                    .cloned()
                    .collect(),
            )
            .into_vec()
        };
        ConversationView {
            messages,
            draft: self.draft.clone(),
            send_in_flight: self.send_in_flight,
            can_send: self.phase != SyncPhase::Stopped
                && !self.send_in_flight
                && !self.draft.trim().is_empty(),
            phase: self.phase,
        }
    }
}

struct Inner {
    config: SyncConfig,
    state: Mutex<ConversationState>,
    view_tx: watch::Sender<ConversationView>,
    poller: Poller,
    sender: MessageSender,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ConversationState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push the derived view; subscribers are only woken when it changed.
    fn publish(&self, state: &ConversationState) {
        let view = state.view();
        self.view_tx.send_if_modified(move |current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    fn apply_snapshot(&self, snapshot: PolledSnapshot) -> bool {
        let mut state = self.lock();
        if state.phase != SyncPhase::Polling {
            return false;
        }
        if self.config.discard_stale_responses && snapshot.seq <= state.last_applied_seq {
            tracing::debug!(
                conversation_id = %self.config.conversation_id,
                seq = snapshot.seq,
                last_applied = state.last_applied_seq,
                "Dropping stale poll response"
            );
            return false;
        }

        state.last_applied_seq = state.last_applied_seq.max(snapshot.seq);
        state.messages = snapshot.messages;
        state.echoes.retain(|echo| !echo.superseded_by(snapshot.seq));
        self.publish(&state);
        true
    }

    /// Runs on every send completion, also after unmount.
    fn release_send(&self) {
        let mut state = self.lock();
        state.send_in_flight = false;
        self.publish(&state);
    }

    fn settle_echo(&self, echo_id: &str, outcome: &SendOutcome) {
        let mut state = self.lock();
        if state.phase == SyncPhase::Stopped {
            return;
        }
        match outcome {
            SendOutcome::Delivered => {
                let issued = self.poller.stats().fetches_issued;
                if let Some(echo) = state.echoes.iter_mut().find(|e| e.message.id == echo_id) {
                    echo.delivered_at_seq = Some(issued);
                }
            }
            SendOutcome::Failed(_) => {
                state.echoes.retain(|e| e.message.id != echo_id);
                self.publish(&state);
            }
        }
    }
}

// =============================================================================
// Synchronizer
// =============================================================================

/// Handle to one widget's conversation state. Clones share the same state.
#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<Inner>,
}

impl Synchronizer {
    pub fn new(config: SyncConfig, client: Arc<dyn ConversationClient>) -> Result<Self, SyncError> {
        Self::with_observer(config, client, Arc::new(TracingObserver))
    }

    /// Build with the HTTP client for `config.base_url`.
    pub fn connect(mut config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let client = Arc::new(HttpConversationClient::new(&config)?);
        Self::new(config, client)
    }

    pub fn with_observer(
        mut config: SyncConfig,
        client: Arc<dyn ConversationClient>,
        observer: Arc<dyn SyncObserver>,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let poller = Poller::new(
            client.clone(),
            observer.clone(),
            PollOptions {
                backoff: config.backoff,
                disconnect_threshold: config.disconnect_threshold,
            },
        );
        let sender = MessageSender::new(client, observer, config.conversation_id.clone());
        let state = ConversationState::default();
        let (view_tx, _) = watch::channel(state.view());

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                view_tx,
                poller,
                sender,
            }),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn phase(&self) -> SyncPhase {
        self.inner.lock().phase
    }

    /// `Idle → Polling`: start polling. A second mount is a no-op; mounting
    /// after unmount is an error.
    pub fn mount(&self) -> Result<(), SyncError> {
        let mut state = self.inner.lock();
        match state.phase {
            SyncPhase::Polling => return Ok(()),
            SyncPhase::Stopped => {
                return Err(SyncError::Lifecycle(
                    "cannot mount a synchronizer that has been unmounted".into(),
                ))
            }
            SyncPhase::Idle => {}
        }

        // Weak, so the poll loop does not keep the state alive on its own.
        let weak = Arc::downgrade(&self.inner);
        let handle = self.inner.poller.start(
            self.inner.config.conversation_id.clone(),
            self.inner.config.poll_interval(),
            move |snapshot: PolledSnapshot| {
                weak.upgrade()
                    .map_or(false, |inner| inner.apply_snapshot(snapshot))
            },
        )?;

        state.poller = Some(handle);
        state.phase = SyncPhase::Polling;
        self.inner.publish(&state);
        tracing::info!(conversation_id = %self.inner.config.conversation_id, "Synchronizer mounted");
        Ok(())
    }

    /// `→ Stopped`: stop polling and make every pending result inert.
    /// Idempotent.
    pub fn unmount(&self) {
        let handle = {
            let mut state = self.inner.lock();
            if state.phase == SyncPhase::Stopped {
                return;
            }
            state.phase = SyncPhase::Stopped;
            self.inner.publish(&state);
            state.poller.take()
        };
        if let Some(handle) = handle {
            handle.stop();
        }
        tracing::info!(conversation_id = %self.inner.config.conversation_id, "Synchronizer unmounted");
    }

    /// Keystroke binding for the input box.
    pub fn set_draft(&self, text: impl Into<String>) {
        let mut state = self.inner.lock();
        if state.phase == SyncPhase::Stopped {
            return;
        }
        state.draft = text.into();
        self.inner.publish(&state);
    }

    /// Submit on Enter without modifiers; `None` for any other key.
    pub fn handle_key(&self, key: &KeyPress) -> Option<Submission> {
        key.is_submit().then(|| self.submit())
    }

    /// Send the current draft.
    ///
    /// The draft is cleared and `send_in_flight` set before this returns;
    /// the network call runs on a spawned task. The displayed messages are
    /// not touched unless `optimistic_echo` is enabled.
    pub fn submit(&self) -> Submission {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!("submit called outside a tokio runtime");
                return Submission::Ignored(IgnoreReason::NoRuntime);
            }
        };

        let (message, echo_id) = {
            let mut state = self.inner.lock();
            if state.phase == SyncPhase::Stopped {
                return Submission::Ignored(IgnoreReason::Stopped);
            }
            if state.send_in_flight {
                return Submission::Ignored(IgnoreReason::InFlight);
            }
            let Some(message) = MessageSender::prepare(&state.draft) else {
                return Submission::Ignored(IgnoreReason::Empty);
            };

            state.draft.clear();
            state.send_in_flight = true;

            let echo_id = if self.inner.config.optimistic_echo {
                let echo = Message {
                    id: format!("local-{}", uuid::Uuid::new_v4()),
                    conversation_id: self.inner.config.conversation_id.clone(),
                    role: ChatRole::User,
                    text: message.text.clone(),
                    created_at: Utc::now().to_rfc3339(),
                };
                let id = echo.id.clone();
                state.echoes.push(Echo {
                    message: echo,
                    delivered_at_seq: None,
                });
                Some(id)
            } else {
                None
            };

            self.inner.publish(&state);
            (message, echo_id)
        };

        let inner = self.inner.clone();
        let handle = runtime.spawn(async move {
            let release = inner.clone();
            let _in_flight = InFlightGuard::new(move || release.release_send());

            let outcome = inner.sender.dispatch(message).await;
            if let Some(id) = echo_id.as_deref() {
                inner.settle_echo(id, &outcome);
            }
            outcome
        });

        Submission::Dispatched(handle)
    }

    /// Current render-ready state.
    pub fn view(&self) -> ConversationView {
        self.inner.view_tx.borrow().clone()
    }

    /// Change feed for the view layer. Only woken when the view differs.
    pub fn subscribe(&self) -> watch::Receiver<ConversationView> {
        self.inner.view_tx.subscribe()
    }

    pub fn stats(&self) -> PollerStats {
        self.inner.poller.stats()
    }
}
