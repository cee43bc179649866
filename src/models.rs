use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use ts_rs::TS;

// ============================================================================
// Messages
// ============================================================================

/// Author role of a message. Closed set; an unknown role makes the
/// containing snapshot malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    Supervisor,
    System,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Supervisor => "supervisor",
            ChatRole::System => "system",
        }
    }
}

/// A message as held by the remote conversation store.
///
/// `created_at` is kept as received when it is a string; any other JSON
/// value (or none) becomes `""`, which [`Message::timestamp`] reads as
/// unparsable. `conversation_id` may be omitted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub conversation_id: String,
    pub role: ChatRole,
    pub text: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: String,
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(raw) => raw,
        _ => String::new(),
    })
}

impl Message {
    /// Parsed `created_at`, or `None` when it cannot be read.
    ///
    /// Accepts RFC 3339 and offset-less ISO-8601 (read as UTC, the form the
    /// store emits for naive datetimes).
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.created_at)
    }
}

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Body of `POST {base}/chat/{conversation_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OutgoingMessage {
    pub text: String,
}

// ============================================================================
// View state
// ============================================================================

/// Lifecycle of a synchronizer: `Idle → Polling → Stopped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    #[default]
    Idle,
    Polling,
    Stopped,
}

/// Render-ready state published to the view layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    /// Sorted ascending by `created_at`.
    pub messages: Vec<Message>,
    pub draft: String,
    pub send_in_flight: bool,
    /// Whether the send affordance is enabled.
    pub can_send: bool,
    pub phase: SyncPhase,
}

impl ConversationView {
    pub fn texts(&self) -> Vec<&str> {
        self.messages.iter().map(|m| m.text.as_str()).collect()
    }
}
