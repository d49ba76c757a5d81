//! Test table backend with operation tracing and fault injection.
//!
//! Wraps [`MemoryTableBackend`] and records every call for test assertions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use podium_core::error::{Error, Result};
use podium_core::table::{
    BatchGetOutput, BatchPutOutput, Item, ItemKey, MemoryTableBackend, ProvisionedCapacity,
    ReadConsistency, TableBackend, WriteCondition, WriteResult,
};
use serde_json::Value;

/// Record of a table operation for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum TableOp {
    /// Single item read.
    Get {
        /// Table read.
        table: String,
        /// Key read.
        key: ItemKey,
        /// Consistency requested.
        consistency: ReadConsistency,
    },
    /// Whole item write.
    Put {
        /// Table written.
        table: String,
        /// Key written.
        key: ItemKey,
        /// Condition used.
        condition: WriteCondition,
    },
    /// Single attribute update.
    UpdateAttribute {
        /// Table written.
        table: String,
        /// Key updated.
        key: ItemKey,
        /// Attribute set.
        name: String,
    },
    /// Item delete.
    Delete {
        /// Table written.
        table: String,
        /// Key deleted.
        key: ItemKey,
    },
    /// Partition query.
    Query {
        /// Table read.
        table: String,
        /// Partition read.
        partition: String,
    },
    /// Secondary index query.
    QueryIndex {
        /// Table read.
        table: String,
        /// Index value read.
        value: String,
    },
    /// Batch read.
    BatchGet {
        /// Table read.
        table: String,
        /// Keys requested.
        keys: usize,
    },
    /// Batch write.
    BatchPut {
        /// Table written.
        table: String,
        /// Items submitted.
        items: usize,
    },
    /// Capacity introspection.
    DescribeCapacity {
        /// Table described.
        table: String,
    },
}

impl TableOp {
    /// Returns true for conditional or unconditional single-item writes.
    #[must_use]
    pub fn is_put(&self) -> bool {
        matches!(self, Self::Put { .. })
    }
}

/// In-memory table backend with operation tracing.
///
/// Faults are injected per call: throttling applies to the next calls of any
/// kind, deferral to the next batch call, and fatal failures to every call
/// against a table until cleared.
#[derive(Debug, Clone, Default)]
pub struct TracingTableBackend {
    inner: Arc<MemoryTableBackend>,
    operations: Arc<Mutex<Vec<TableOp>>>,
    fail_tables: Arc<Mutex<Vec<String>>>,
    throttle_remaining: Arc<AtomicUsize>,
    defer_remaining: Arc<AtomicUsize>,
    latency: Option<Duration>,
}

impl TracingTableBackend {
    /// Creates a new empty tracing backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend that sleeps before every call.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Sets the provisioned capacity reported for a table.
    pub fn set_capacity(&self, table: &str, capacity: ProvisionedCapacity) {
        self.inner.set_capacity(table, capacity).expect("lock");
    }

    /// Returns the wrapped backend.
    #[must_use]
    pub fn inner(&self) -> &MemoryTableBackend {
        &self.inner
    }

    /// Returns all items of a table.
    #[must_use]
    pub fn items(&self, table: &str) -> Vec<Item> {
        self.inner.scan(table).expect("lock")
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<TableOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Fails the next `count` calls with a throttling error.
    pub fn throttle_next(&self, count: usize) {
        self.throttle_remaining.store(count, Ordering::SeqCst);
    }

    /// Leaves the last `count` keys or items of the next batch call unprocessed.
    pub fn defer_next_batch(&self, count: usize) {
        self.defer_remaining.store(count, Ordering::SeqCst);
    }

    /// Fails every call against `table` with a non-retryable error.
    pub fn inject_failure(&self, table: impl Into<String>) {
        self.fail_tables.lock().expect("lock").push(table.into());
    }

    /// Clears all injected fatal failures.
    pub fn clear_failures(&self) {
        self.fail_tables.lock().expect("lock").clear();
    }

    fn record(&self, op: TableOp) {
        self.operations.lock().expect("lock").push(op);
    }

    async fn before_call(&self, table: &str) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if self.fail_tables.lock().expect("lock").iter().any(|t| t == table) {
            return Err(Error::Internal {
                message: format!("injected failure for table: {table}"),
            });
        }

        let throttled = self
            .throttle_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return Err(Error::throttled(format!("injected throttle for table: {table}")));
        }
        Ok(())
    }

    fn take_deferred(&self, len: usize) -> usize {
        self.defer_remaining.swap(0, Ordering::SeqCst).min(len)
    }
}

#[async_trait::async_trait]
impl TableBackend for TracingTableBackend {
    async fn get(
        &self,
        table: &str,
        key: &ItemKey,
        consistency: ReadConsistency,
    ) -> Result<Option<Item>> {
        self.before_call(table).await?;
        self.record(TableOp::Get {
            table: table.to_string(),
            key: key.clone(),
            consistency,
        });
        self.inner.get(table, key, consistency).await
    }

    async fn put(&self, table: &str, item: Item, condition: WriteCondition) -> Result<WriteResult> {
        self.before_call(table).await?;
        self.record(TableOp::Put {
            table: table.to_string(),
            key: item.key.clone(),
            condition: condition.clone(),
        });
        self.inner.put(table, item, condition).await
    }

    async fn update_attribute(
        &self,
        table: &str,
        key: &ItemKey,
        name: &str,
        value: Value,
        condition: WriteCondition,
    ) -> Result<WriteResult> {
        self.before_call(table).await?;
        self.record(TableOp::UpdateAttribute {
            table: table.to_string(),
            key: key.clone(),
            name: name.to_string(),
        });
        self.inner
            .update_attribute(table, key, name, value, condition)
            .await
    }

    async fn delete(
        &self,
        table: &str,
        key: &ItemKey,
        condition: WriteCondition,
    ) -> Result<WriteResult> {
        self.before_call(table).await?;
        self.record(TableOp::Delete {
            table: table.to_string(),
            key: key.clone(),
        });
        self.inner.delete(table, key, condition).await
    }

    async fn query(&self, table: &str, partition: &str) -> Result<Vec<Item>> {
        self.before_call(table).await?;
        self.record(TableOp::Query {
            table: table.to_string(),
            partition: partition.to_string(),
        });
        self.inner.query(table, partition).await
    }

    async fn query_index(&self, table: &str, attribute: &str, value: &str) -> Result<Vec<Item>> {
        self.before_call(table).await?;
        self.record(TableOp::QueryIndex {
            table: table.to_string(),
            value: value.to_string(),
        });
        self.inner.query_index(table, attribute, value).await
    }

    async fn batch_get(&self, table: &str, mut keys: Vec<ItemKey>) -> Result<BatchGetOutput> {
        self.before_call(table).await?;
        self.record(TableOp::BatchGet {
            table: table.to_string(),
            keys: keys.len(),
        });

        let deferred = self.take_deferred(keys.len());
        let unprocessed = keys.split_off(keys.len() - deferred);
        let mut output = self.inner.batch_get(table, keys).await?;
        output.unprocessed = unprocessed;
        Ok(output)
    }

    async fn batch_put(&self, table: &str, mut items: Vec<Item>) -> Result<BatchPutOutput> {
        self.before_call(table).await?;
        self.record(TableOp::BatchPut {
            table: table.to_string(),
            items: items.len(),
        });

        let deferred = self.take_deferred(items.len());
        let unprocessed = items.split_off(items.len() - deferred);
        self.inner.batch_put(table, items).await?;
        Ok(BatchPutOutput { unprocessed })
    }

    async fn describe_capacity(&self, table: &str) -> Result<ProvisionedCapacity> {
        self.before_call(table).await?;
        self.record(TableOp::DescribeCapacity {
            table: table.to_string(),
        });
        self.inner.describe_capacity(table).await
    }
}
