use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the fee engine.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The node data source was unreachable or timed out for one channel.
    /// The channel is skipped this cycle and retried on the next one.
    #[error("snapshot unavailable for channel {channel_id}: {reason}")]
    SnapshotUnavailable { channel_id: String, reason: String },

    /// The node refused a fee update (e.g. invalid channel state).
    /// Recorded in the change history with `success = false`.
    #[error("fee update rejected for channel {channel_id}: {reason}")]
    ApplyRejected { channel_id: String, reason: String },

    /// A time-series store write failed. Never rolls back an already
    /// applied fee change.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Malformed configuration or rule file. Fatal at load time; the
    /// engine refuses to start.
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP error from the node management API.
    #[error("HTTP error (status {status}): {message}")]
    Http { status: u16, message: String },

    /// A request to the node management API exceeded its deadline.
    #[error("request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// JSON response could not be decoded.
    #[error("JSON parse error: {0}")]
    JsonParse(String),

    /// Generic transport error (connection refused, DNS, TLS).
    #[error("request error: {0}")]
    Request(String),
}

// Convenience constructors for common error patterns
impl Error {
    /// Create a snapshot-unavailable error for a channel.
    pub fn snapshot_unavailable(channel_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::SnapshotUnavailable {
            channel_id: channel_id.into(),
            reason: reason.into(),
        }
    }

    /// Create an apply-rejected error for a channel.
    pub fn apply_rejected(channel_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ApplyRejected {
            channel_id: channel_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a persistence error.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Error::Persistence(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Whether this error means the channel should simply be skipped for
    /// the current cycle (as opposed to aborting the whole cycle).
    pub fn is_per_channel(&self) -> bool {
        matches!(
            self,
            Error::SnapshotUnavailable { .. } | Error::ApplyRejected { .. }
        )
    }
}
