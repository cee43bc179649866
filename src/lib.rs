//! Conversation synchronization core for an embedded chat widget.
//!
//! A [`Synchronizer`] polls the conversation store, keeps the fetched
//! messages in chronological order, and sends the user's draft as a
//! best-effort, fire-and-forget message. The view layer renders whatever
//! [`Synchronizer::subscribe`] yields.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;

pub use config::SyncConfig;
pub use engine::{
    normalize, BackoffPolicy, ConversationClient, HttpConversationClient, IgnoreReason, KeyPress,
    OrderedMessages, SendOutcome, Submission, SyncEvent, SyncObserver, Synchronizer,
};
pub use error::SyncError;
pub use models::{ChatRole, ConversationView, Message, OutgoingMessage, SyncPhase};
