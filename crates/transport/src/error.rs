//! Classified transport failures.

use std::time::Duration;

/// Closed set of failure kinds the pipelines make retry decisions on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network blip, timeout, server error or rate limit. Retry with backoff.
    Transient,
    /// The payload exceeds what the platform accepts. Fatal for this chunk size.
    PayloadTooLarge,
    /// Credentials or chat rejected. Fatal.
    Unauthorized,
    /// The locator no longer resolves (get/delete only).
    NotFound,
}

/// Errors produced by a remote transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transient failure: {reason}")]
    Transient {
        reason: String,
        /// Server-requested wait before the next request, if any.
        retry_after: Option<Duration>,
    },

    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl TransportError {
    /// Shorthand for a transient failure without a server-provided delay.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } => ErrorKind::Transient,
            Self::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::NotFound(_) => ErrorKind::NotFound,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Server-requested delay carried by a rate-limit response.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        // Anything that fails below the API layer (connect, timeout, body
        // decode) is worth another attempt. The URL embeds the bot token.
        Self::transient(e.without_url().to_string())
    }
}
