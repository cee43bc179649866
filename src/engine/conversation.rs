//! Snapshot normalization: raw fetch payload → stably ordered messages.
//!
//! Pure logic, no I/O, so every rule here is unit-testable in isolation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::SyncError;
use crate::models::Message;

/// Messages sorted ascending by `created_at`, ready for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedMessages(Vec<Message>);

impl OrderedMessages {
    pub fn as_slice(&self) -> &[Message] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn texts(&self) -> Vec<&str> {
        self.0.iter().map(|m| m.text.as_str()).collect()
    }

    pub fn into_vec(self) -> Vec<Message> {
        self.0
    }
}

impl<'a> IntoIterator for &'a OrderedMessages {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Turn one fetched payload into an ordered message list.
///
/// Fails with [`SyncError::MalformedSnapshot`] when `messages` is absent, is
/// not an array, or holds an entry lacking a string `id` or `text` or a known
/// `role`. A missing or non-string `created_at` is not fatal. Callers treat
/// a failure as "keep what is displayed".
///
/// Duplicate ids collapse to the last occurrence. Ordering is a stable sort
/// on the parsed timestamp; entries whose `created_at` cannot be parsed sort
/// before all others and keep their snapshot order.
pub fn normalize(snapshot: &Value) -> Result<OrderedMessages, SyncError> {
    let entries = snapshot
        .get("messages")
        .ok_or_else(|| SyncError::MalformedSnapshot("missing 'messages' field".into()))?
        .as_array()
        .ok_or_else(|| SyncError::MalformedSnapshot("'messages' is not an array".into()))?;

    let mut parsed = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let message = Message::deserialize(entry)
            .map_err(|e| SyncError::MalformedSnapshot(format!("entry {}: {}", index, e)))?;
        parsed.push(message);
    }

    Ok(order(dedupe_last_wins(parsed)))
}

/// Keep the last occurrence of each id, at the position of that occurrence.
fn dedupe_last_wins(messages: Vec<Message>) -> Vec<Message> {
    let keep: Vec<bool> = {
        let mut last_index: HashMap<&str, usize> = HashMap::with_capacity(messages.len());
        for (i, m) in messages.iter().enumerate() {
            last_index.insert(m.id.as_str(), i);
        }
        messages
            .iter()
            .enumerate()
            .map(|(i, m)| last_index.get(m.id.as_str()) == Some(&i))
            .collect()
    };
    if keep.iter().all(|k| *k) {
        return messages;
    }

    messages
        .into_iter()
        .zip(keep)
        .filter_map(|(m, keep)| keep.then_some(m))
        .collect()
}

/// Stable sort by timestamp. `None` (unparsable) orders before any `Some`.
pub(crate) fn order(messages: Vec<Message>) -> OrderedMessages {
    let mut keyed: Vec<(Option<DateTime<Utc>>, Message)> =
        messages.into_iter().map(|m| (m.timestamp(), m)).collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    OrderedMessages(keyed.into_iter().map(|(_, m)| m).collect())
}
