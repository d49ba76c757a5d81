//! Worker self-invocation.
//!
//! Workers scale out by asking the hosting platform to start another
//! invocation of themselves. Invocations are fire-and-forget: a successful
//! call only means the platform accepted the request.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::RecordingInvoker;

/// Starts additional worker invocations.
#[async_trait]
pub trait WorkerInvoker: Send + Sync + 'static {
    /// Requests one more worker invocation.
    async fn invoke_self(&self) -> Result<()>;
}
