//! Engine error taxonomy.

use std::time::Duration;

/// Errors produced by the collection and automation engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// All extraction strategies exhausted without producing records.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// Network-layer extraction failed after exhausting retries.
    #[error("network extraction failed: {0}")]
    Network(String),

    /// Signing capability was unavailable or rejected the request.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The host reported rate limiting; a Retry-After hint may be attached.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Reply target could not be located within the click/scroll budget.
    #[error("comment not found: {0}")]
    CommentNotFound(String),

    /// Target account does not accept mentions.
    #[error("mention unavailable for {0}")]
    MentionUnavailable(String),

    /// Generic reply submission failure.
    #[error("reply submission failed: {0}")]
    ReplyFailed(String),

    /// A bridge request did not receive its response within the timeout.
    #[error("bridge request timed out after {0:?}")]
    BridgeTimeout(Duration),

    /// The peer context is gone (extension context invalidated).
    #[error("bridge disconnected: {0}")]
    BridgeDisconnected(String),

    /// Run rejected before starting (pre-flight validation).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A session for this tab is already active.
    #[error("session already active for tab {0}")]
    SessionActive(u32),

    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Whether this error class should feed the rate limit monitor.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}
