//! Error types and result aliases for Podium.
//!
//! This module defines the shared error types used across all Podium components.
//! Conditional-write failures are not errors: they are reported as
//! [`WriteResult::ConditionFailed`](crate::table::WriteResult::ConditionFailed).

/// Result alias for table and key operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by table backends and the key model.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backend rejected the request because provisioned capacity was exceeded.
    ///
    /// Always retryable.
    #[error("throttled: {message}")]
    Throttled {
        /// Description of the throttled operation.
        message: String,
    },

    /// The backend failed for a reason other than throttling.
    #[error("table backend error: {message}")]
    Storage {
        /// What the backend reported.
        message: String,
        /// Backend error this was raised from.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Item attributes did not match the expected record shape.
    #[error("item encoding error: {message}")]
    Serialization {
        /// Which field or shape was wrong.
        message: String,
    },

    /// The requested table or index does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A request was rejected before reaching the table, e.g. an oversized batch.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A backend invariant was broken.
    #[error("internal backend error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },
}

impl Error {
    /// Creates a backend error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a backend error wrapping the client error that caused it.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a throttling error.
    #[must_use]
    pub fn throttled(message: impl Into<String>) -> Self {
        Self::Throttled {
            message: message.into(),
        }
    }

    /// Creates an item encoding error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true if the backend signalled that capacity was exceeded.
    #[must_use]
    pub const fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttled_is_detected() {
        assert!(Error::throttled("write capacity").is_throttled());
        assert!(!Error::storage("access denied").is_throttled());
    }

    #[test]
    fn backend_error_keeps_cause() {
        let cause = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = Error::storage_with_source("conditional put", cause);
        assert_eq!(err.to_string(), "table backend error: conditional put");
        assert!(std::error::Error::source(&err).is_some());
    }
}
