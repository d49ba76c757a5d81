//! Key-value table abstraction for the leaderboard and semaphore tables.
//!
//! This module defines the contract every table backend must implement:
//! - Items addressed by a partition key and a sort key
//! - Conditional writes, updates and deletes
//! - Strongly or eventually consistent point reads
//! - Partition queries and a secondary index equality query
//! - Batch reads and writes that report the unprocessed subset
//! - Provisioned capacity introspection
//!
//! ## Failure Model
//!
//! A write whose condition does not hold is a normal
//! [`WriteResult::ConditionFailed`], never an error. A backend that is over its
//! provisioned capacity returns [`Error::Throttled`](crate::Error::Throttled),
//! which callers treat as retryable. Any other error is fatal for the request.

pub mod memory;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub use memory::MemoryTableBackend;

/// Maximum number of keys accepted by a single [`TableBackend::batch_get`].
pub const MAX_BATCH_GET: usize = 100;

/// Maximum number of items accepted by a single [`TableBackend::batch_put`].
pub const MAX_BATCH_PUT: usize = 25;

/// Primary key of an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    /// Partition (hash) key.
    pub partition: String,
    /// Sort (range) key, unique within a partition.
    pub sort: String,
}

impl ItemKey {
    /// Creates a new item key.
    #[must_use]
    pub fn new(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: sort.into(),
        }
    }
}

/// A stored item: its key plus a bag of JSON attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Primary key.
    pub key: ItemKey,
    /// Non-key attributes.
    pub attributes: Map<String, Value>,
}

impl Item {
    /// Creates an item with no attributes.
    #[must_use]
    pub fn new(key: ItemKey) -> Self {
        Self {
            key,
            attributes: Map::new(),
        }
    }

    /// Creates an item whose attributes are the fields of a serializable value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the value does not serialize to a
    /// JSON object.
    pub fn from_value<T: Serialize>(key: ItemKey, value: &T) -> Result<Self> {
        match serde_json::to_value(value) {
            Ok(Value::Object(attributes)) => Ok(Self { key, attributes }),
            Ok(other) => Err(Error::serialization(format!(
                "expected an object, got {other}"
            ))),
            Err(e) => Err(Error::serialization(e.to_string())),
        }
    }

    /// Decodes the attributes into a typed value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the attributes do not match `T`.
    pub fn to_value<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.attributes.clone()))
            .map_err(|e| Error::serialization(e.to_string()))
    }

    /// Sets an attribute (builder style).
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Returns an attribute value, if present.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

/// Consistency of a point read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadConsistency {
    /// May return a stale value.
    #[default]
    Eventual,
    /// Reflects every write acknowledged before the read started.
    Strong,
}

/// Condition guarding a write, update or delete.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCondition {
    /// Apply unconditionally.
    None,
    /// Apply only if the item does not exist.
    DoesNotExist,
    /// Apply only if the item exists.
    Exists,
    /// Apply only if the item exists and `name` equals `value`.
    AttributeEquals {
        /// Attribute name.
        name: String,
        /// Expected value.
        value: Value,
    },
    /// Apply only if the item exists and the lease attribute is absent, null, or
    /// an epoch-millisecond timestamp strictly before `now_millis`.
    LeaseFree {
        /// Attribute holding the lease expiry.
        attribute: String,
        /// Current time in epoch milliseconds.
        now_millis: i64,
    },
}

impl WriteCondition {
    /// Creates an attribute equality condition.
    #[must_use]
    pub fn attribute_equals(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::AttributeEquals {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Evaluates the condition against the current item.
    #[must_use]
    pub fn evaluate(&self, current: Option<&Item>) -> bool {
        match (self, current) {
            (Self::None, _) => true,
            (Self::DoesNotExist, current) => current.is_none(),
            (Self::Exists, current) => current.is_some(),
            (Self::AttributeEquals { name, value }, Some(item)) => {
                item.attribute(name) == Some(value)
            }
            (Self::LeaseFree { attribute, now_millis }, Some(item)) => {
                match item.attribute(attribute) {
                    None | Some(Value::Null) => true,
                    Some(v) => v.as_i64().is_some_and(|expires| expires < *now_millis),
                }
            }
            (Self::AttributeEquals { .. } | Self::LeaseFree { .. }, None) => false,
        }
    }
}

/// Result of a conditional write, update or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// The condition held and the write was applied.
    Success,
    /// The condition did not hold; nothing was changed.
    ConditionFailed,
}

/// Output of a batch read.
#[derive(Debug, Clone, Default)]
pub struct BatchGetOutput {
    /// Items that were found. Missing keys are simply absent.
    pub items: Vec<Item>,
    /// Keys the backend did not process and that must be retried.
    pub unprocessed: Vec<ItemKey>,
}

/// Output of a batch write.
#[derive(Debug, Clone, Default)]
pub struct BatchPutOutput {
    /// Items the backend did not write and that must be retried.
    pub unprocessed: Vec<Item>,
}

/// Provisioned throughput of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionedCapacity {
    /// Read capacity units per second.
    pub read_units: u64,
    /// Write capacity units per second.
    pub write_units: u64,
}

impl ProvisionedCapacity {
    /// Creates a capacity description.
    #[must_use]
    pub const fn new(read_units: u64, write_units: u64) -> Self {
        Self {
            read_units,
            write_units,
        }
    }

    /// Returns the limiting capacity, `min(read, write)`.
    #[must_use]
    pub const fn limiting(self) -> u64 {
        if self.read_units < self.write_units {
            self.read_units
        } else {
            self.write_units
        }
    }
}

/// Table backend trait.
///
/// All backends (managed key-value services, memory) implement this trait.
/// Every method addresses a named table.
#[async_trait]
pub trait TableBackend: Send + Sync + 'static {
    /// Reads one item.
    ///
    /// Returns `None` if the item does not exist.
    async fn get(
        &self,
        table: &str,
        key: &ItemKey,
        consistency: ReadConsistency,
    ) -> Result<Option<Item>>;

    /// Writes a whole item if the condition holds.
    async fn put(&self, table: &str, item: Item, condition: WriteCondition) -> Result<WriteResult>;

    /// Sets one attribute of an existing item if the condition holds.
    ///
    /// A missing item yields [`WriteResult::ConditionFailed`]; updates never
    /// create items.
    async fn update_attribute(
        &self,
        table: &str,
        key: &ItemKey,
        name: &str,
        value: Value,
        condition: WriteCondition,
    ) -> Result<WriteResult>;

    /// Deletes an item if the condition holds.
    ///
    /// An unconditional delete of a missing item succeeds (idempotent).
    async fn delete(
        &self,
        table: &str,
        key: &ItemKey,
        condition: WriteCondition,
    ) -> Result<WriteResult>;

    /// Returns every item of a partition, ordered by sort key.
    async fn query(&self, table: &str, partition: &str) -> Result<Vec<Item>>;

    /// Returns every item whose string `attribute` equals `value`.
    ///
    /// Index reads are eventually consistent and unordered.
    async fn query_index(&self, table: &str, attribute: &str, value: &str) -> Result<Vec<Item>>;

    /// Reads up to [`MAX_BATCH_GET`] items.
    async fn batch_get(&self, table: &str, keys: Vec<ItemKey>) -> Result<BatchGetOutput>;

    /// Unconditionally writes up to [`MAX_BATCH_PUT`] items.
    async fn batch_put(&self, table: &str, items: Vec<Item>) -> Result<BatchPutOutput>;

    /// Returns the provisioned throughput of a table.
    ///
    /// Returns `Error::NotFound` if the table is unknown.
    async fn describe_capacity(&self, table: &str) -> Result<ProvisionedCapacity>;
}
