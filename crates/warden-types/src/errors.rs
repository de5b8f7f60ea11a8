/// Unified error type for the Warden monitor.
///
/// All crates use this error type for propagation across crate boundaries.
/// Backend-specific errors are converted into the appropriate variant at the
/// point where they leave their module.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// Malformed or missing configuration (settings file or entry source).
    #[error("config error: {0}")]
    Config(String),

    /// The backing store has no value for the requested entry.
    #[error("value not found: {0}")]
    NotFound(String),

    /// Read or write failure against a value store backend.
    #[error("store I/O error: {0}")]
    StoreIo(String),

    /// Audit log or configuration persistence failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A notification channel failed to deliver to one recipient.
    #[error("delivery error: {0}")]
    Delivery(String),

    /// An alert was deliberately suppressed by the hourly rate limit.
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// The monitor worker has shut down and can no longer accept commands.
    #[error("monitor stopped")]
    MonitorStopped,

    /// No monitored entry matches the given identity.
    #[error("unknown entry: {0}")]
    UnknownEntry(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

impl WardenError {
    /// Whether this error means the value is absent rather than unreadable.
    pub fn is_not_found(&self) -> bool {
        matches!(self, WardenError::NotFound(_))
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(err: serde_json::Error) -> Self {
        WardenError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for WardenError {
    fn from(err: serde_yaml::Error) -> Self {
        WardenError::Serialization(err.to_string())
    }
}
