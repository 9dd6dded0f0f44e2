use thiserror::Error;

/// Type alias for Result with SyncError
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error taxonomy for the synchronization scheduler
///
/// Nothing in here is fatal to the scheduler process: every variant is caught
/// at the per-account boundary, logged, and the rotation moves on.
#[derive(Error, Debug)]
pub enum SyncError {
    /// OAuth token exchange was rejected - skip the account this round
    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    /// A single protocol failed (auth, connection, HTTP status) - try the next one
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The outbound proxy itself failed; every protocol would fail the same way
    #[error("Proxy transport error: {0}")]
    ProxyTransport(String),

    /// Every protocol in the fallback chain failed
    #[error("All protocols failed: {}", errors.join("; "))]
    AllProtocolsFailed { errors: Vec<String> },

    /// Persistent store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error (file operations, sockets, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite error
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl SyncError {
    /// Check if the error came from the proxy rather than the provider
    pub fn is_proxy_failure(&self) -> bool {
        matches!(self, SyncError::ProxyTransport(_))
    }

    /// Check if the next scheduled tick may succeed where this attempt failed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::TokenRefresh(_)
                | SyncError::Protocol(_)
                | SyncError::ProxyTransport(_)
                | SyncError::AllProtocolsFailed { .. }
                | SyncError::Io(_)
        )
    }

    /// Classify a reqwest failure
    ///
    /// With a proxy configured, failing to connect means failing to reach the
    /// proxy. Timeouts and everything else surface as protocol failures.
    pub fn from_transport(error: reqwest::Error, proxied: bool) -> Self {
        if proxied && (error.is_connect() || mentions_proxy(&error)) {
            return SyncError::ProxyTransport(error_chain(&error));
        }
        if error.is_timeout() {
            return SyncError::Protocol(format!("request timed out: {}", error_chain(&error)));
        }
        SyncError::Protocol(error_chain(&error))
    }
}

fn mentions_proxy(error: &reqwest::Error) -> bool {
    let chain = error_chain(error).to_lowercase();
    chain.contains("proxy") || chain.contains("tunnel")
}

/// Render an error with all of its sources, reqwest hides the useful part there
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

/// Truncate a message to at most `max_chars` characters
pub fn truncate_chars(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        message.to_string()
    } else {
        message.chars().take(max_chars).collect()
    }
}
