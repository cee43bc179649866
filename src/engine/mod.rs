pub mod client;
pub mod conversation;
pub mod observer;
pub mod poller;
pub mod sender;
pub mod synchronizer;

pub use self::client::{ConversationClient, HttpConversationClient};
pub use self::conversation::{normalize, OrderedMessages};
pub use self::observer::{SyncEvent, SyncObserver, TracingObserver};
pub use self::poller::{BackoffPolicy, PollOptions, Poller, PollerHandle, PollerStats};
pub use self::sender::{MessageSender, SendOutcome};
pub use self::synchronizer::{IgnoreReason, KeyPress, Submission, Synchronizer};
