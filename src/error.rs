//! Error taxonomy for the relay engine.
//!
//! Every error a client can observe is one of these kinds. The `Display`
//! form is the client-facing message carried in `error { message }`;
//! `kind()` is the stable label used in logs.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Malformed payload, missing field, out-of-range coordinate,
    /// empty identifier, unknown role.
    #[error("{0}")]
    Validation(String),

    /// Event issued by a connection whose role does not permit it.
    #[error("{0}")]
    Authorization(String),

    /// Producer exceeded the per-minute update budget.
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    /// Referenced driver or account does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Target exists but its transport is not live.
    #[error("{0}")]
    Unavailable(String),

    /// `resumeSession` with an unknown or replaced session key.
    #[error("{0}")]
    Session(String),

    /// Unexpected failure inside a handler. Logged with detail,
    /// surfaced to the client as a generic message.
    #[error("internal server error")]
    Internal(String),
}

impl RelayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Stable label for structured logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Authorization(_) => "authorization",
            Self::RateLimited(_) => "rate_limited",
            Self::NotFound(_) => "not_found",
            Self::Unavailable(_) => "unavailable",
            Self::Session(_) => "session",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_error_message_is_generic() {
        let err = RelayError::Internal("lock poisoned".to_string());
        assert_eq!(err.to_string(), "internal server error");
    }

    #[test]
    fn validation_message_passes_through() {
        let err = RelayError::validation("lat out of range");
        assert_eq!(err.to_string(), "lat out of range");
        assert_eq!(err.kind(), "validation");
    }
}
