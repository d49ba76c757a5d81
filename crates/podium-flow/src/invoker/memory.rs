//! Recording invoker for testing.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::WorkerInvoker;
use crate::error::{Error, Result};

/// Invoker that counts requests instead of starting workers.
///
/// Can be told to reject a number of upcoming invocations.
#[derive(Debug, Default)]
pub struct RecordingInvoker {
    invocations: AtomicUsize,
    failures_remaining: AtomicUsize,
}

impl RecordingInvoker {
    /// Creates an invoker that accepts every request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the next `count` invocations.
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Returns the number of accepted invocations.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerInvoker for RecordingInvoker {
    async fn invoke_self(&self) -> Result<()> {
        let rejected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(Error::invocation("invocation rejected"));
        }
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
