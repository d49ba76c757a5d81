//! In-memory table backend implementation for testing.
//!
//! This module provides [`MemoryTableBackend`], a simple in-memory implementation
//! of the [`TableBackend`] trait suitable for testing and development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No persistence, no cross-process coordination
//! - **Never throttles**: Fault injection lives in the test utilities crate
//! - **Index reads are strongly consistent**: Stronger than a real secondary index

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use super::{
    BatchGetOutput, BatchPutOutput, Item, ItemKey, ProvisionedCapacity, ReadConsistency,
    TableBackend, WriteCondition, WriteResult, MAX_BATCH_GET, MAX_BATCH_PUT,
};
use crate::error::{Error, Result};

type Table = BTreeMap<ItemKey, Item>;

/// In-memory table backend for testing.
///
/// Tables are created lazily on first write. Thread-safe via `RwLock`.
#[derive(Debug, Default)]
pub struct MemoryTableBackend {
    tables: RwLock<HashMap<String, Table>>,
    capacities: RwLock<HashMap<String, ProvisionedCapacity>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("table lock poisoned")
}

impl MemoryTableBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the provisioned capacity of a table (builder style).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn with_capacity(
        mut self,
        table: impl Into<String>,
        capacity: ProvisionedCapacity,
    ) -> Result<Self> {
        self.capacities
            .get_mut()
            .map_err(poison_err)?
            .insert(table.into(), capacity);
        Ok(self)
    }

    /// Changes the provisioned capacity of a table.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_capacity(&self, table: &str, capacity: ProvisionedCapacity) -> Result<()> {
        self.capacities
            .write()
            .map_err(poison_err)?
            .insert(table.to_string(), capacity);
        Ok(())
    }

    /// Returns the number of items stored in a table.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn item_count(&self, table: &str) -> Result<usize> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables.get(table).map_or(0, BTreeMap::len))
    }

    /// Returns a snapshot of every item in a table, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn scan(&self, table: &str) -> Result<Vec<Item>> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl TableBackend for MemoryTableBackend {
    async fn get(
        &self,
        table: &str,
        key: &ItemKey,
        _consistency: ReadConsistency,
    ) -> Result<Option<Item>> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables.get(table).and_then(|t| t.get(key)).cloned())
    }

    async fn put(&self, table: &str, item: Item, condition: WriteCondition) -> Result<WriteResult> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        let entries = tables.entry(table.to_string()).or_default();

        if !condition.evaluate(entries.get(&item.key)) {
            return Ok(WriteResult::ConditionFailed);
        }
        entries.insert(item.key.clone(), item);
        drop(tables);

        Ok(WriteResult::Success)
    }

    async fn update_attribute(
        &self,
        table: &str,
        key: &ItemKey,
        name: &str,
        value: Value,
        condition: WriteCondition,
    ) -> Result<WriteResult> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        let Some(current) = tables.get_mut(table).and_then(|t| t.get_mut(key)) else {
            return Ok(WriteResult::ConditionFailed);
        };

        if !condition.evaluate(Some(current)) {
            return Ok(WriteResult::ConditionFailed);
        }
        current.attributes.insert(name.to_string(), value);
        drop(tables);

        Ok(WriteResult::Success)
    }

    async fn delete(
        &self,
        table: &str,
        key: &ItemKey,
        condition: WriteCondition,
    ) -> Result<WriteResult> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        let Some(entries) = tables.get_mut(table) else {
            return Ok(if condition.evaluate(None) {
                WriteResult::Success
            } else {
                WriteResult::ConditionFailed
            });
        };

        if !condition.evaluate(entries.get(key)) {
            return Ok(WriteResult::ConditionFailed);
        }
        entries.remove(key);
        drop(tables);

        Ok(WriteResult::Success)
    }

    async fn query(&self, table: &str, partition: &str) -> Result<Vec<Item>> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables
            .get(table)
            .map(|t| {
                t.values()
                    .filter(|item| item.key.partition == partition)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query_index(&self, table: &str, attribute: &str, value: &str) -> Result<Vec<Item>> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables
            .get(table)
            .map(|t| {
                t.values()
                    .filter(|item| item.attribute(attribute).and_then(Value::as_str) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn batch_get(&self, table: &str, keys: Vec<ItemKey>) -> Result<BatchGetOutput> {
        if keys.len() > MAX_BATCH_GET {
            return Err(Error::InvalidInput(format!(
                "batch get of {} keys exceeds limit of {MAX_BATCH_GET}",
                keys.len()
            )));
        }

        let tables = self.tables.read().map_err(poison_err)?;
        let items = tables
            .get(table)
            .map(|t| keys.iter().filter_map(|k| t.get(k).cloned()).collect())
            .unwrap_or_default();

        Ok(BatchGetOutput {
            items,
            unprocessed: Vec::new(),
        })
    }

    async fn batch_put(&self, table: &str, items: Vec<Item>) -> Result<BatchPutOutput> {
        if items.len() > MAX_BATCH_PUT {
            return Err(Error::InvalidInput(format!(
                "batch put of {} items exceeds limit of {MAX_BATCH_PUT}",
                items.len()
            )));
        }

        let mut tables = self.tables.write().map_err(poison_err)?;
        let entries = tables.entry(table.to_string()).or_default();
        for item in items {
            entries.insert(item.key.clone(), item);
        }
        drop(tables);

        Ok(BatchPutOutput::default())
    }

    async fn describe_capacity(&self, table: &str) -> Result<ProvisionedCapacity> {
        let capacities = self.capacities.read().map_err(poison_err)?;
        capacities
            .get(table)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("table not found: {table}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TABLE: &str = "scores";

    fn record(user: &str, key: &str, score: i64) -> Item {
        Item::new(ItemKey::new(user, key))
            .with_attribute("score", score)
            .with_attribute("scoreBlock", format!("{key}_0"))
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let backend = MemoryTableBackend::new();
        let item = record("u1", "_(year-2017)", 5);

        let result = backend
            .put(TABLE, item.clone(), WriteCondition::None)
            .await
            .expect("put should succeed");
        assert_eq!(result, WriteResult::Success);

        let fetched = backend
            .get(TABLE, &item.key, ReadConsistency::Strong)
            .await
            .expect("get should succeed");
        assert_eq!(fetched, Some(item));
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let backend = MemoryTableBackend::new();
        let fetched = backend
            .get(TABLE, &ItemKey::new("nobody", "k"), ReadConsistency::Eventual)
            .await
            .expect("get should succeed");
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn test_conditional_put_compare_and_swap() {
        let backend = MemoryTableBackend::new();
        let first = record("u1", "k", 10);

        let result = backend
            .put(TABLE, first.clone(), WriteCondition::DoesNotExist)
            .await
            .unwrap();
        assert_eq!(result, WriteResult::Success);

        // Second create loses.
        let result = backend
            .put(TABLE, first, WriteCondition::DoesNotExist)
            .await
            .unwrap();
        assert_eq!(result, WriteResult::ConditionFailed);

        // Stale expected score loses.
        let result = backend
            .put(
                TABLE,
                record("u1", "k", 30),
                WriteCondition::attribute_equals("score", 5),
            )
            .await
            .unwrap();
        assert_eq!(result, WriteResult::ConditionFailed);

        let result = backend
            .put(
                TABLE,
                record("u1", "k", 30),
                WriteCondition::attribute_equals("score", 10),
            )
            .await
            .unwrap();
        assert_eq!(result, WriteResult::Success);
    }

    #[tokio::test]
    async fn test_update_attribute_never_creates() {
        let backend = MemoryTableBackend::new();
        let key = ItemKey::new("group", "token");

        let result = backend
            .update_attribute(TABLE, &key, "expiresAt", json!(1), WriteCondition::None)
            .await
            .unwrap();
        assert_eq!(result, WriteResult::ConditionFailed);
        assert_eq!(backend.item_count(TABLE).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_attribute_lease_free() {
        let backend = MemoryTableBackend::new();
        let key = ItemKey::new("group", "token");
        backend
            .put(TABLE, Item::new(key.clone()), WriteCondition::None)
            .await
            .unwrap();

        let take = |now_millis| WriteCondition::LeaseFree {
            attribute: "expiresAt".into(),
            now_millis,
        };

        let result = backend
            .update_attribute(TABLE, &key, "expiresAt", json!(2_000), take(1_000))
            .await
            .unwrap();
        assert_eq!(result, WriteResult::Success);

        // Still held at t=1500.
        let result = backend
            .update_attribute(TABLE, &key, "expiresAt", json!(3_000), take(1_500))
            .await
            .unwrap();
        assert_eq!(result, WriteResult::ConditionFailed);

        // Expired at t=2001.
        let result = backend
            .update_attribute(TABLE, &key, "expiresAt", json!(4_000), take(2_001))
            .await
            .unwrap();
        assert_eq!(result, WriteResult::Success);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_conditional() {
        let backend = MemoryTableBackend::new();
        let key = ItemKey::new("g", "t");

        let result = backend.delete(TABLE, &key, WriteCondition::None).await.unwrap();
        assert_eq!(result, WriteResult::Success);

        backend
            .put(
                TABLE,
                Item::new(key.clone()).with_attribute("expiresAt", 10),
                WriteCondition::None,
            )
            .await
            .unwrap();
        let result = backend
            .delete(
                TABLE,
                &key,
                WriteCondition::LeaseFree {
                    attribute: "expiresAt".into(),
                    now_millis: 5,
                },
            )
            .await
            .unwrap();
        assert_eq!(result, WriteResult::ConditionFailed);
        assert_eq!(backend.item_count(TABLE).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_query_partition_and_index() {
        let backend = MemoryTableBackend::new();
        for (user, key) in [("u1", "a"), ("u1", "b"), ("u2", "a")] {
            backend
                .put(TABLE, record(user, key, 1), WriteCondition::None)
                .await
                .unwrap();
        }

        let u1 = backend.query(TABLE, "u1").await.unwrap();
        assert_eq!(u1.len(), 2);
        assert_eq!(u1[0].key.sort, "a");
        assert_eq!(u1[1].key.sort, "b");

        let block_a = backend.query_index(TABLE, "scoreBlock", "a_0").await.unwrap();
        assert_eq!(block_a.len(), 2);

        assert!(backend.query(TABLE, "u3").await.unwrap().is_empty());
        assert!(backend.query("other", "u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_limits() {
        let backend = MemoryTableBackend::new();

        let too_many: Vec<Item> = (0..=MAX_BATCH_PUT)
            .map(|i| Item::new(ItemKey::new("p", i.to_string())))
            .collect();
        assert!(backend.batch_put(TABLE, too_many).await.is_err());

        let keys: Vec<ItemKey> = (0..=MAX_BATCH_GET)
            .map(|i| ItemKey::new("p", i.to_string()))
            .collect();
        assert!(backend.batch_get(TABLE, keys).await.is_err());
    }

    #[tokio::test]
    async fn test_batch_put_then_get() {
        let backend = MemoryTableBackend::new();
        let items: Vec<Item> = (0..3)
            .map(|i| Item::new(ItemKey::new("p", i.to_string())))
            .collect();

        let out = backend.batch_put(TABLE, items).await.unwrap();
        assert!(out.unprocessed.is_empty());

        let keys = vec![ItemKey::new("p", "0"), ItemKey::new("p", "9")];
        let out = backend.batch_get(TABLE, keys).await.unwrap();
        assert_eq!(out.items.len(), 1);
        assert!(out.unprocessed.is_empty());
    }

    #[tokio::test]
    async fn test_describe_capacity() {
        let backend = MemoryTableBackend::new()
            .with_capacity(TABLE, ProvisionedCapacity::new(400, 1000))
            .unwrap();
        assert_eq!(
            backend.describe_capacity(TABLE).await.unwrap(),
            ProvisionedCapacity::new(400, 1000)
        );
        assert!(matches!(
            backend.describe_capacity("missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn poisoned_capacity_lock_is_an_error() {
        let backend = MemoryTableBackend::new();
        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = backend.capacities.write().unwrap();
            panic!("writer died holding the lock");
        }));
        assert!(poisoned.is_err());

        assert!(backend
            .set_capacity(TABLE, ProvisionedCapacity::new(1, 1))
            .is_err());
        let err = backend
            .with_capacity(TABLE, ProvisionedCapacity::new(1, 1))
            .unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
    }
}
