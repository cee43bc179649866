//! Synchronizer behavior against a hand-driven in-memory store.
//!
//! Every fetch and send parks until the test resolves it, so interleavings
//! (slow polls, teardown races, sends in flight) are explicit.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chat_sync::engine::synchronizer::{IgnoreReason, KeyPress, Submission};
use chat_sync::models::OutgoingMessage;
use chat_sync::{ConversationClient, ConversationView, SendOutcome, SyncConfig, SyncError, SyncEvent, Synchronizer};
use serde_json::{json, Value};
use tokio::sync::{oneshot, watch};

type FetchReply = Result<Value, SyncError>;
type SendReply = Result<(), SyncError>;

#[derive(Default)]
struct ParkedStore {
    fetches: Mutex<Vec<Option<oneshot::Sender<FetchReply>>>>,
    sends: Mutex<Vec<Option<oneshot::Sender<SendReply>>>>,
    sent_texts: Mutex<Vec<String>>,
}

impl ParkedStore {
    fn fetch_calls(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    /// Resolve the oldest fetch that is still parked.
    fn resolve_next_fetch(&self, reply: FetchReply) {
        let tx = self
            .fetches
            .lock()
            .unwrap()
            .iter_mut()
            .find_map(|slot| slot.take())
            .expect("no parked fetch");
        let _ = tx.send(reply);
    }

    fn resolve_fetch(&self, index: usize, reply: FetchReply) {
        let tx = self.fetches.lock().unwrap()[index]
            .take()
            .expect("fetch already resolved");
        let _ = tx.send(reply);
    }

    fn resolve_next_send(&self, reply: SendReply) {
        let tx = self
            .sends
            .lock()
            .unwrap()
            .iter_mut()
            .find_map(|slot| slot.take())
            .expect("no parked send");
        let _ = tx.send(reply);
    }
}

#[async_trait::async_trait]
impl ConversationClient for ParkedStore {
    async fn fetch(&self, _conversation_id: &str) -> Result<Value, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.fetches.lock().unwrap().push(Some(tx));
        rx.await
            .unwrap_or_else(|_| Err(SyncError::Fetch("store dropped request".into())))
    }

    async fn send(&self, _conversation_id: &str, message: &OutgoingMessage) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.sent_texts.lock().unwrap().push(message.text.clone());
        self.sends.lock().unwrap().push(Some(tx));
        rx.await
            .unwrap_or_else(|_| Err(SyncError::Send("store dropped request".into())))
    }
}

fn message(id: &str, role: &str, text: &str, created_at: &str) -> Value {
    json!({
        "id": id,
        "conversation_id": "demo-conversation",
        "role": role,
        "text": text,
        "created_at": created_at,
    })
}

fn first_snapshot() -> Value {
    json!({ "messages": [message("1", "user", "Hi", "2024-01-01T00:00:00Z")] })
}

fn second_snapshot() -> Value {
    // Deliberately out of order on the wire.
    json!({ "messages": [
        message("2", "assistant", "Hello!", "2024-01-01T00:00:01Z"),
        message("1", "user", "Hi", "2024-01-01T00:00:00Z")
    ]})
}

fn setup(config: SyncConfig) -> (Arc<ParkedStore>, Synchronizer) {
    let store = Arc::new(ParkedStore::default());
    let sync = Synchronizer::new(config, store.clone()).unwrap();
    (store, sync)
}

async fn wait_for_view(
    rx: &mut watch::Receiver<ConversationView>,
    pred: impl FnMut(&ConversationView) -> bool,
) -> ConversationView {
    tokio::time::timeout(Duration::from_secs(30), rx.wait_for(pred))
        .await
        .expect("view never reached expected state")
        .expect("view channel closed")
        .clone()
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition never became true");
}

#[tokio::test(start_paused = true)]
async fn end_to_end_snapshots_replace_and_sort() {
    let (store, sync) = setup(SyncConfig::default());
    let mut rx = sync.subscribe();
    sync.mount().unwrap();

    wait_until(|| store.fetch_calls() >= 1).await;
    store.resolve_next_fetch(Ok(first_snapshot()));
    let view = wait_for_view(&mut rx, |v| !v.messages.is_empty()).await;
    assert_eq!(view.texts(), vec!["Hi"]);

    wait_until(|| store.fetch_calls() >= 2).await;
    store.resolve_next_fetch(Ok(second_snapshot()));
    let view = wait_for_view(&mut rx, |v| v.messages.len() == 2).await;
    assert_eq!(view.texts(), vec!["Hi", "Hello!"]);
}

#[tokio::test(start_paused = true)]
async fn store_payloads_without_conversation_id_are_applied() {
    let (store, sync) = setup(SyncConfig::default());
    let mut rx = sync.subscribe();
    sync.mount().unwrap();

    wait_until(|| store.fetch_calls() >= 1).await;
    store.resolve_next_fetch(Ok(json!({ "messages": [
        { "id": "1", "role": "user", "text": "Hi", "created_at": "2024-01-01T00:00:00Z" }
    ]})));
    let view = wait_for_view(&mut rx, |v| !v.messages.is_empty()).await;
    assert_eq!(view.texts(), vec!["Hi"]);

    wait_until(|| store.fetch_calls() >= 2).await;
    store.resolve_next_fetch(Ok(json!({ "messages": [
        { "id": "2", "role": "assistant", "text": "Hello!", "created_at": "2024-01-01T00:00:01Z" },
        { "id": "1", "role": "user", "text": "Hi", "created_at": "2024-01-01T00:00:00Z" }
    ]})));
    let view = wait_for_view(&mut rx, |v| v.messages.len() == 2).await;
    assert_eq!(view.texts(), vec!["Hi", "Hello!"]);
}

#[tokio::test(start_paused = true)]
async fn null_timestamp_sorts_first_instead_of_freezing_view() {
    let (store, sync) = setup(SyncConfig::default());
    let mut rx = sync.subscribe();
    sync.mount().unwrap();

    wait_until(|| store.fetch_calls() >= 1).await;
    store.resolve_next_fetch(Ok(json!({ "messages": [
        { "id": "1", "role": "user", "text": "Hi", "created_at": "2024-01-01T00:00:00Z" },
        { "id": "2", "role": "assistant", "text": "Yo", "created_at": null }
    ]})));
    let view = wait_for_view(&mut rx, |v| !v.messages.is_empty()).await;
    assert_eq!(view.texts(), vec!["Yo", "Hi"]);
}

#[tokio::test(start_paused = true)]
async fn first_fetch_is_immediate() {
    let (store, sync) = setup(SyncConfig::default());
    sync.mount().unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(store.fetch_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_fetches_leave_view_untouched() {
    let (store, sync) = setup(SyncConfig::default());
    let mut rx = sync.subscribe();
    sync.mount().unwrap();

    wait_until(|| store.fetch_calls() >= 1).await;
    store.resolve_next_fetch(Ok(first_snapshot()));
    wait_for_view(&mut rx, |v| v.texts() == vec!["Hi"]).await;

    wait_until(|| store.fetch_calls() >= 3).await;
    store.resolve_next_fetch(Err(SyncError::Fetch("connection reset".into())));
    store.resolve_next_fetch(Ok(json!({ "messages": "garbage" })));
    wait_until(|| sync.stats().fetches_failed >= 2).await;
    assert_eq!(sync.view().texts(), vec!["Hi"]);
    assert_eq!(sync.view().phase, chat_sync::SyncPhase::Polling);

    // The loop is still alive and the next good snapshot applies normally.
    wait_until(|| store.fetch_calls() >= 4).await;
    store.resolve_next_fetch(Ok(second_snapshot()));
    let view = wait_for_view(&mut rx, |v| v.messages.len() == 2).await;
    assert_eq!(view.texts(), vec!["Hi", "Hello!"]);
}

#[tokio::test(start_paused = true)]
async fn snapshot_without_messages_is_a_no_op() {
    let (store, sync) = setup(SyncConfig::default());
    let mut rx = sync.subscribe();
    sync.mount().unwrap();

    wait_until(|| store.fetch_calls() >= 1).await;
    store.resolve_next_fetch(Ok(first_snapshot()));
    wait_for_view(&mut rx, |v| !v.messages.is_empty()).await;
    rx.borrow_and_update();

    wait_until(|| store.fetch_calls() >= 2).await;
    store.resolve_next_fetch(Ok(json!({})));
    wait_until(|| sync.stats().fetches_failed >= 1).await;

    assert!(!rx.has_changed().unwrap());
    assert_eq!(sync.view().texts(), vec!["Hi"]);
}

#[tokio::test(start_paused = true)]
async fn results_after_unmount_are_discarded() {
    let (store, sync) = setup(SyncConfig::default());
    let mut rx = sync.subscribe();
    sync.mount().unwrap();
    wait_until(|| store.fetch_calls() >= 1).await;

    sync.unmount();
    rx.borrow_and_update();

    store.resolve_next_fetch(Ok(first_snapshot()));
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(!rx.has_changed().unwrap());
    assert!(sync.view().messages.is_empty());
    assert_eq!(sync.stats().fetches_applied, 0);
    // No new polls were issued after teardown.
    assert_eq!(store.fetch_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn send_clears_draft_before_network_resolves() {
    let (store, sync) = setup(SyncConfig::default());
    sync.set_draft("Hello");

    let submission = sync.submit();
    assert!(submission.is_dispatched());
    let view = sync.view();
    assert_eq!(view.draft, "");
    assert!(view.send_in_flight);
    assert!(!view.can_send);

    wait_until(|| !store.sends.lock().unwrap().is_empty()).await;
    store.resolve_next_send(Ok(()));
    assert_eq!(submission.outcome().await, Some(SendOutcome::Delivered));

    let view = sync.view();
    assert!(!view.send_in_flight);
    assert!(view.messages.is_empty(), "no local echo by default");
    assert_eq!(store.sent_texts.lock().unwrap().as_slice(), &["Hello".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn failed_send_is_swallowed() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let recorder = events.clone();
    let store = Arc::new(ParkedStore::default());
    let sync = Synchronizer::with_observer(
        SyncConfig::default(),
        store.clone(),
        Arc::new(move |e: &SyncEvent| recorder.lock().unwrap().push(e.clone())),
    )
    .unwrap();

    sync.set_draft("  Hello  ");
    let submission = sync.submit();
    wait_until(|| !store.sends.lock().unwrap().is_empty()).await;
    store.resolve_next_send(Err(SyncError::Send("status 502".into())));

    assert!(matches!(submission.outcome().await, Some(SendOutcome::Failed(_))));
    let view = sync.view();
    assert!(!view.send_in_flight);
    assert_eq!(view.draft, "", "draft is not restored after failure");
    assert_eq!(store.sent_texts.lock().unwrap().as_slice(), &["Hello".to_string()]);
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, SyncEvent::SendFailed { .. })));
}

#[tokio::test(start_paused = true)]
async fn send_completing_after_unmount_releases_in_flight() {
    let (store, sync) = setup(SyncConfig::default());
    sync.mount().unwrap();
    sync.set_draft("Hello");
    let submission = sync.submit();
    wait_until(|| !store.sends.lock().unwrap().is_empty()).await;

    sync.unmount();
    assert!(sync.view().send_in_flight);
    store.resolve_next_send(Ok(()));
    assert_eq!(submission.outcome().await, Some(SendOutcome::Delivered));

    let view = sync.view();
    assert!(!view.send_in_flight);
    assert!(!view.can_send);
    assert_eq!(view.phase, chat_sync::SyncPhase::Stopped);
    assert!(view.messages.is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_submit_is_blocked_while_in_flight() {
    let (store, sync) = setup(SyncConfig::default());
    sync.set_draft("one");
    let first = sync.submit();
    assert!(first.is_dispatched());

    sync.set_draft("two");
    assert!(matches!(sync.submit(), Submission::Ignored(IgnoreReason::InFlight)));
    assert_eq!(sync.view().draft, "two");
    assert!(!sync.view().can_send);

    wait_until(|| !store.sends.lock().unwrap().is_empty()).await;
    store.resolve_next_send(Ok(()));
    first.outcome().await;

    assert!(sync.view().can_send);
    let second = sync.handle_key(&KeyPress::enter()).expect("Enter submits");
    assert!(second.is_dispatched());
    wait_until(|| store.sends.lock().unwrap().len() >= 2).await;
    store.resolve_next_send(Ok(()));
    second.outcome().await;
    assert_eq!(
        store.sent_texts.lock().unwrap().as_slice(),
        &["one".to_string(), "two".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn shift_enter_does_not_submit() {
    let (store, sync) = setup(SyncConfig::default());
    sync.set_draft("Hello");
    assert!(sync.handle_key(&KeyPress::enter().with_shift()).is_none());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(store.sent_texts.lock().unwrap().is_empty());
    assert_eq!(sync.view().draft, "Hello");
}

#[tokio::test(start_paused = true)]
async fn optimistic_echo_shows_until_next_snapshot() {
    let config = SyncConfig {
        optimistic_echo: true,
        ..SyncConfig::default()
    };
    let (store, sync) = setup(config);
    let mut rx = sync.subscribe();
    sync.mount().unwrap();

    wait_until(|| store.fetch_calls() >= 1).await;
    store.resolve_next_fetch(Ok(first_snapshot()));
    wait_for_view(&mut rx, |v| !v.messages.is_empty()).await;

    sync.set_draft("Hello");
    let submission = sync.submit();
    let view = sync.view();
    assert_eq!(view.texts(), vec!["Hi", "Hello"]);
    assert!(view.messages[1].id.starts_with("local-"));

    wait_until(|| !store.sends.lock().unwrap().is_empty()).await;
    store.resolve_next_send(Ok(()));
    submission.outcome().await;

    wait_until(|| store.fetch_calls() >= 2).await;
    store.resolve_next_fetch(Ok(json!({ "messages": [
        message("1", "user", "Hi", "2024-01-01T00:00:00Z"),
        message("user-2", "user", "Hello", "2024-01-01T00:00:05Z")
    ]})));
    let view = wait_for_view(&mut rx, |v| v.messages.last().map(|m| m.id.as_str()) == Some("user-2")).await;
    assert_eq!(view.texts(), vec!["Hi", "Hello"]);
    assert!(view.messages.iter().all(|m| !m.id.starts_with("local-")));
}

#[tokio::test(start_paused = true)]
async fn optimistic_echo_survives_polls_issued_before_delivery() {
    let config = SyncConfig {
        optimistic_echo: true,
        ..SyncConfig::default()
    };
    let (store, sync) = setup(config);
    let mut rx = sync.subscribe();
    sync.mount().unwrap();

    wait_until(|| store.fetch_calls() >= 1).await;
    store.resolve_next_fetch(Ok(first_snapshot()));
    wait_for_view(&mut rx, |v| !v.messages.is_empty()).await;

    sync.set_draft("Hello");
    let submission = sync.submit();
    wait_until(|| !store.sends.lock().unwrap().is_empty()).await;

    // This poll goes out while the send is still pending.
    wait_until(|| store.fetch_calls() >= 2).await;
    store.resolve_next_fetch(Ok(first_snapshot()));
    wait_until(|| sync.stats().fetches_applied >= 2).await;
    assert_eq!(sync.view().texts(), vec!["Hi", "Hello"]);

    store.resolve_next_send(Ok(()));
    submission.outcome().await;
    assert_eq!(sync.view().texts(), vec!["Hi", "Hello"]);

    wait_until(|| store.fetch_calls() >= 3).await;
    store.resolve_next_fetch(Ok(json!({ "messages": [
        message("1", "user", "Hi", "2024-01-01T00:00:00Z"),
        message("user-2", "user", "Hello", "2024-01-01T00:00:05Z")
    ]})));
    let view = wait_for_view(&mut rx, |v| v.messages.iter().all(|m| !m.id.starts_with("local-"))).await;
    assert_eq!(view.texts(), vec!["Hi", "Hello"]);
}

#[tokio::test(start_paused = true)]
async fn optimistic_echo_is_withdrawn_on_failure() {
    let config = SyncConfig {
        optimistic_echo: true,
        ..SyncConfig::default()
    };
    let (store, sync) = setup(config);
    sync.set_draft("Hello");
    let submission = sync.submit();
    assert_eq!(sync.view().messages.len(), 1);

    wait_until(|| !store.sends.lock().unwrap().is_empty()).await;
    store.resolve_next_send(Err(SyncError::Send("offline".into())));
    submission.outcome().await;
    assert!(sync.view().messages.is_empty());
}

#[tokio::test(start_paused = true)]
async fn overlapping_polls_last_applied_wins_by_default() {
    let (store, sync) = setup(SyncConfig::default());
    let mut rx = sync.subscribe();
    sync.mount().unwrap();
    wait_until(|| store.fetch_calls() >= 2).await;

    // The second-issued poll answers first, then the first one lands.
    store.resolve_fetch(1, Ok(second_snapshot()));
    wait_for_view(&mut rx, |v| v.messages.len() == 2).await;
    store.resolve_fetch(0, Ok(first_snapshot()));
    let view = wait_for_view(&mut rx, |v| v.messages.len() == 1).await;
    assert_eq!(view.texts(), vec!["Hi"]);
}

#[tokio::test(start_paused = true)]
async fn stale_polls_are_dropped_when_enabled() {
    let config = SyncConfig {
        discard_stale_responses: true,
        ..SyncConfig::default()
    };
    let (store, sync) = setup(config);
    let mut rx = sync.subscribe();
    sync.mount().unwrap();
    wait_until(|| store.fetch_calls() >= 2).await;

    store.resolve_fetch(1, Ok(second_snapshot()));
    wait_for_view(&mut rx, |v| v.messages.len() == 2).await;
    store.resolve_fetch(0, Ok(first_snapshot()));
    wait_until(|| sync.stats().fetches_discarded >= 1).await;

    assert_eq!(sync.view().texts(), vec!["Hi", "Hello!"]);
}
