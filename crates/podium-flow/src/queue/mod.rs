//! At-least-once message queue abstraction.
//!
//! This module provides:
//!
//! - [`MessageQueue`]: Trait for receiving and acknowledging score events
//! - [`QueueMessage`]: A received message and its delivery receipt
//! - [`InMemoryQueue`]: In-memory queue for testing
//!
//! ## Delivery Semantics
//!
//! A received message stays invisible until it is deleted through its
//! receipt. Messages that are never deleted are delivered again, so consumers
//! must tolerate duplicates.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::InMemoryQueue;

/// Maximum receipts accepted by a single [`MessageQueue::delete_batch`].
pub const MAX_DELETE_BATCH: usize = 10;

/// A received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Handle used to acknowledge this delivery.
    pub receipt: String,
    /// Raw payload.
    pub body: String,
}

/// Result of a batch delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteBatchOutput {
    /// Receipts that could not be deleted.
    pub failed: Vec<String>,
}

/// Queue abstraction for score events.
#[async_trait]
pub trait MessageQueue: Send + Sync + 'static {
    /// Receives up to `max` messages. An empty result means the queue looked
    /// empty at the time of the call.
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>>;

    /// Deletes up to [`MAX_DELETE_BATCH`] messages by receipt.
    async fn delete_batch(&self, receipts: &[String]) -> Result<DeleteBatchOutput>;
}
