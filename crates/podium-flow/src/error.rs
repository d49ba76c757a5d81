//! Error types for the score pipeline and worker coordination.
//!
//! Optimistic conflicts and admission denial are outcomes, not errors. They
//! surface as [`WriteResult::ConditionFailed`](podium_core::WriteResult) inside
//! retry loops and as [`AdmissionDecision::Denied`](crate::semaphore::AdmissionDecision).

/// The result type used throughout podium-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pipeline, store and worker operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An input event could not be decoded or failed validation.
    ///
    /// Malformed input is never retried.
    #[error("malformed input: {message}")]
    MalformedInput {
        /// Why the input was rejected.
        message: String,
    },

    /// A bounded retry policy ran out of attempts.
    #[error("{operation} gave up after {attempts} attempts")]
    RetriesExhausted {
        /// The operation that was retried.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Applying an increment would overflow the stored score.
    ///
    /// The record is left unchanged and the increment is not retried.
    #[error("score overflow for {user_id} on {score_key}: {score} + {delta}")]
    ScoreOverflow {
        /// User whose score overflowed.
        user_id: String,
        /// Canonical score key of the record.
        score_key: String,
        /// Score observed before the increment.
        score: i64,
        /// Delta that could not be applied.
        delta: i64,
    },

    /// The message queue rejected a request.
    #[error("queue error: {message}")]
    Queue {
        /// Description of the queue failure.
        message: String,
    },

    /// A worker self-invocation could not be issued.
    #[error("invocation error: {message}")]
    Invocation {
        /// Description of the invocation failure.
        message: String,
    },

    /// Configuration was missing or invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An error from podium-core.
    #[error("core error: {0}")]
    Core(#[from] podium_core::Error),
}

impl Error {
    /// Creates a new malformed input error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedInput {
            message: message.into(),
        }
    }

    /// Creates a new queue error.
    #[must_use]
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    /// Creates a new invocation error.
    #[must_use]
    pub fn invocation(message: impl Into<String>) -> Self {
        Self::Invocation {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns true if the table backend reported throttling.
    #[must_use]
    pub const fn is_throttled(&self) -> bool {
        matches!(self, Self::Core(podium_core::Error::Throttled { .. }))
    }

    /// Returns true if this error came from rejected input.
    #[must_use]
    pub const fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedInput { .. })
    }
}
