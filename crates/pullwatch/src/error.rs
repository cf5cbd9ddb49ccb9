use thiserror::Error;

/// Errors produced by the API request layer and the paginator.
///
/// The variants partition every possible request outcome the engine reacts
/// to differently: some are real failures, some are success-equivalent
/// ([`ApiError::NotModified`], [`ApiError::Gone`]) and are only routed
/// through the error channel so that pagination can stop cleanly.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Pre-empted before any network call was made, either because the URL
    /// is on the backoff ledger or because the owning server already failed
    /// this cycle.
    #[error("request to {url} pre-empted without a network call")]
    Throttled { url: String },

    /// Network or timeout failure with no response.
    #[error("transport failure: {message}")]
    Transport { message: String },

    /// Response with a failing status code (other than 304/404/410).
    #[error("HTTP error status {status}")]
    Http { status: u16 },

    /// 304 Not Modified: nothing new, success-equivalent for pagination.
    #[error("not modified")]
    NotModified,

    /// 404/410: the resource legitimately no longer exists.
    #[error("resource gone (status {status})")]
    Gone { status: u16 },

    /// The response body could not be parsed.
    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    /// The sync cycle was cancelled before the request was dispatched.
    #[error("cancelled")]
    Cancelled,
}

impl ApiError {
    /// Create a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// The status code carried by the outcome, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status } | Self::Gone { status } => Some(*status),
            Self::NotModified => Some(304),
            _ => None,
        }
    }

    /// True for 404/410: the resource is legitimately absent, which child
    /// collection fetches treat as "nothing there" rather than a failure.
    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone { .. })
    }

    /// True for 304 Not Modified.
    #[must_use]
    pub fn is_not_modified(&self) -> bool {
        matches!(self, Self::NotModified)
    }
}

/// Result type for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;
