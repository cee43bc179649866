use serde::Serialize;

/// Crate-wide error type. Every fallible function returns `Result<T, SyncError>`.
///
/// `Fetch`, `MalformedSnapshot` and `Send` are recovered by the synchronizer
/// and never reach the view; they are only handed to the observer hook.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("{0}")]
    Internal(String),
}

impl SyncError {
    /// Stable machine-readable tag, also used as the serialized `kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Fetch(_) => "fetch",
            SyncError::MalformedSnapshot(_) => "malformed_snapshot",
            SyncError::Send(_) => "send",
            SyncError::Config(_) => "config",
            SyncError::Lifecycle(_) => "lifecycle",
            SyncError::Internal(_) => "internal",
        }
    }
}

/// Serialized as `{ error: "...", kind: "..." }` so an observer can forward it
/// over IPC unchanged.
impl Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("SyncError", 2)?;
        s.serialize_field("error", &self.to_string())?;
        s.serialize_field("kind", self.kind())?;
        s.end()
    }
}
