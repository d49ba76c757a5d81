//! In-memory message queue implementation for testing.
//!
//! Received messages move to an in-flight set until deleted.
//! [`InMemoryQueue::expire_in_flight`] stands in for a visibility timeout and
//! makes every undeleted delivery visible again.

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{DeleteBatchOutput, MessageQueue, QueueMessage, MAX_DELETE_BATCH};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Stored {
    body: String,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    visible: VecDeque<Stored>,
    in_flight: HashMap<String, Stored>,
    deleted: usize,
}

/// In-memory at-least-once queue.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: RwLock<QueueState>,
}

/// Converts a lock poison error to a queue error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::queue("message queue lock poisoned")
}

impl InMemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn send(&self, body: impl Into<String>) -> Result<()> {
        self.state.write().map_err(poison_err)?.visible.push_back(Stored {
            body: body.into(),
            deliveries: 0,
        });
        Ok(())
    }

    /// Makes every undeleted in-flight message visible again.
    ///
    /// Returns how many messages were returned to the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn expire_in_flight(&self) -> Result<usize> {
        let mut state = self.state.write().map_err(poison_err)?;
        let expired: Vec<Stored> = state.in_flight.drain().map(|(_, m)| m).collect();
        let count = expired.len();
        state.visible.extend(expired);
        drop(state);
        Ok(count)
    }

    /// Returns the number of messages waiting to be received.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn visible_len(&self) -> Result<usize> {
        Ok(self.state.read().map_err(poison_err)?.visible.len())
    }

    /// Returns the number of received but undeleted messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn in_flight_len(&self) -> Result<usize> {
        Ok(self.state.read().map_err(poison_err)?.in_flight.len())
    }

    /// Returns the number of messages deleted so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn deleted_count(&self) -> Result<usize> {
        Ok(self.state.read().map_err(poison_err)?.deleted)
    }

    /// Returns the bodies of in-flight messages delivered more than once.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn redelivered_bodies(&self) -> Result<Vec<String>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .in_flight
            .values()
            .filter(|m| m.deliveries > 1)
            .map(|m| m.body.clone())
            .collect())
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let take = max.min(state.visible.len());
        let batch: Vec<Stored> = state.visible.drain(..take).collect();
        let mut received = Vec::with_capacity(take);

        for mut stored in batch {
            stored.deliveries += 1;
            let receipt = ulid::Ulid::new().to_string();
            received.push(QueueMessage {
                receipt: receipt.clone(),
                body: stored.body.clone(),
            });
            state.in_flight.insert(receipt, stored);
        }
        drop(state);

        Ok(received)
    }

    async fn delete_batch(&self, receipts: &[String]) -> Result<DeleteBatchOutput> {
        if receipts.len() > MAX_DELETE_BATCH {
            return Err(Error::queue(format!(
                "delete batch of {} exceeds limit of {MAX_DELETE_BATCH}",
                receipts.len()
            )));
        }

        let mut state = self.state.write().map_err(poison_err)?;
        let mut failed = Vec::new();
        for receipt in receipts {
            if state.in_flight.remove(receipt).is_some() {
                state.deleted += 1;
            } else {
                failed.push(receipt.clone());
            }
        }
        drop(state);

        Ok(DeleteBatchOutput { failed })
    }
}
