//! Leaderboard records and the optimistic-concurrency leaderboard store.
//!
//! One record exists per `(user, facet combination)`. The table is keyed by
//! user id (partition) and canonical score key (sort); a secondary index on
//! `scoreBlock` groups records of one combination into logarithmic score
//! buckets so that top-N reads only touch the highest buckets.
//!
//! ## Write Protocol
//!
//! Increments are read-modify-write cycles guarded by a condition on the
//! observed score:
//!
//! 1. Strongly consistent read of the current record
//! 2. `new_score = current (or 0) + delta`, `scoreBlock` recomputed
//! 3. Conditional put: `score == observed`, or "does not exist" for a first write
//! 4. On condition failure or throttling, back off and start over at step 1
//!
//! No increment is dropped: with the default unbounded policy the loop only
//! ends on success or on a non-retryable backend error.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use podium_core::{
    block_index_key, score_block, score_block_key, FacetSet, Item, ItemKey, ReadConsistency,
    TableBackend, WriteCondition, WriteResult,
};

use crate::batch;
use crate::config::LeaderboardConfig;
use crate::error::{Error, Result};
use crate::metrics::PodiumMetrics;
use crate::retry::{retry_throttled, RetryPolicy};

/// Attribute holding the score.
pub const SCORE_ATTRIBUTE: &str = "score";

/// Attribute backing the top-N secondary index.
pub const SCORE_BLOCK_ATTRIBUTE: &str = "scoreBlock";

/// One user's score on one facet combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardRecord {
    /// User identifier.
    pub user_id: String,
    /// Accumulated score.
    pub score: i64,
    /// Canonical key of the facet combination.
    pub score_key: String,
    /// `score_key + "_" + score_block(score)`.
    pub score_block: String,
}

impl LeaderboardRecord {
    /// Creates a record, deriving its score block from the score.
    #[must_use]
    pub fn new(user_id: impl Into<String>, score_key: impl Into<String>, score: i64) -> Self {
        let score_key = score_key.into();
        Self {
            user_id: user_id.into(),
            score,
            score_block: score_block_key(&score_key, score),
            score_key,
        }
    }

    /// Returns the table key of this record.
    #[must_use]
    pub fn item_key(&self) -> ItemKey {
        ItemKey::new(self.user_id.clone(), self.score_key.clone())
    }

    fn to_item(&self) -> Result<Item> {
        Ok(Item::from_value(self.item_key(), self)?)
    }

    fn from_item(item: &Item) -> Result<Self> {
        Ok(item.to_value()?)
    }
}

/// Leaderboard store over a table backend.
///
/// The leaderboard table is only ever mutated through
/// [`increment_score`](Self::increment_score).
pub struct LeaderboardStore<S: TableBackend + ?Sized> {
    store: Arc<S>,
    table: String,
    max_recognizable_score: i64,
    policy: RetryPolicy,
    metrics: PodiumMetrics,
}

impl<S: TableBackend + ?Sized> Clone for LeaderboardStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            table: self.table.clone(),
            max_recognizable_score: self.max_recognizable_score,
            policy: self.policy,
            metrics: self.metrics,
        }
    }
}

impl<S: TableBackend + ?Sized> std::fmt::Debug for LeaderboardStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderboardStore")
            .field("table", &self.table)
            .field("max_recognizable_score", &self.max_recognizable_score)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<S: TableBackend + ?Sized> LeaderboardStore<S> {
    /// Creates a leaderboard store.
    #[must_use]
    pub fn new(store: Arc<S>, config: &LeaderboardConfig) -> Self {
        Self {
            store,
            table: config.table.clone(),
            max_recognizable_score: config.max_recognizable_score,
            policy: config.retry_policy(),
            metrics: PodiumMetrics::new(),
        }
    }

    /// Replaces the retry policy (builder style).
    #[must_use]
    pub const fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the leaderboard table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Atomically adds `delta` to a user's score on a facet combination.
    ///
    /// Returns the record as written.
    ///
    /// # Errors
    ///
    /// Returns a non-retryable backend error, [`Error::ScoreOverflow`] if the
    /// sum does not fit, or [`Error::RetriesExhausted`] under a bounded retry
    /// policy.
    pub async fn increment_score(
        &self,
        user_id: &str,
        facets: &FacetSet,
        delta: i64,
    ) -> Result<LeaderboardRecord> {
        self.increment_key(user_id, &facets.canonical_key(), delta)
            .await
    }

    /// Atomically adds `delta` to a user's score on a canonical score key.
    ///
    /// # Errors
    ///
    /// See [`increment_score`](Self::increment_score).
    pub async fn increment_key(
        &self,
        user_id: &str,
        score_key: &str,
        delta: i64,
    ) -> Result<LeaderboardRecord> {
        let key = ItemKey::new(user_id, score_key);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.try_increment(&key, delta).await {
                Ok(Some(record)) => {
                    tracing::debug!(
                        user_id,
                        score_key,
                        score = record.score,
                        attempts,
                        "score incremented"
                    );
                    return Ok(record);
                }
                Ok(None) => {
                    self.metrics.record_cas_conflict();
                    tracing::debug!(user_id, score_key, attempts, "score changed underneath, retrying");
                }
                Err(e) if e.is_throttled() => {
                    self.metrics.record_throttle("increment_score");
                    tracing::debug!(user_id, score_key, attempts, "increment throttled, retrying");
                }
                Err(e) => return Err(e),
            }

            if !self.policy.allows_retry(attempts) {
                return Err(Error::RetriesExhausted {
                    operation: "increment_score".into(),
                    attempts,
                });
            }
            self.policy.backoff(attempts).await;
        }
    }

    /// One read-modify-write cycle. `None` means the condition failed.
    async fn try_increment(&self, key: &ItemKey, delta: i64) -> Result<Option<LeaderboardRecord>> {
        let current = self
            .store
            .get(&self.table, key, ReadConsistency::Strong)
            .await?
            .map(|item| LeaderboardRecord::from_item(&item))
            .transpose()?;

        let (observed, condition) = match &current {
            Some(record) => (
                record.score,
                WriteCondition::attribute_equals(SCORE_ATTRIBUTE, record.score),
            ),
            None => (0, WriteCondition::DoesNotExist),
        };

        let score = observed
            .checked_add(delta)
            .ok_or_else(|| Error::ScoreOverflow {
                user_id: key.partition.clone(),
                score_key: key.sort.clone(),
                score: observed,
                delta,
            })?;
        let record = LeaderboardRecord::new(key.partition.clone(), key.sort.clone(), score);

        match self.store.put(&self.table, record.to_item()?, condition).await? {
            WriteResult::Success => Ok(Some(record)),
            WriteResult::ConditionFailed => Ok(None),
        }
    }

    /// Returns the top `limit` records of a facet combination.
    ///
    /// Blocks are scanned from the block of the maximum recognizable score down
    /// to block 0, stopping as soon as `limit` records are collected. Results
    /// are ordered by score descending, ties by user id ascending. Scores above
    /// the maximum recognizable score are never returned.
    ///
    /// # Errors
    ///
    /// Returns a non-retryable backend error or a record decoding error.
    pub async fn top_n(&self, facets: &FacetSet, limit: usize) -> Result<Vec<LeaderboardRecord>> {
        let score_key = facets.canonical_key();
        let mut collected = Vec::new();
        let mut block = score_block(self.max_recognizable_score);

        while block >= 0 && collected.len() < limit {
            let index_key = block_index_key(&score_key, block);
            let items = retry_throttled(&self.policy, "top_n", || {
                self.store
                    .query_index(&self.table, SCORE_BLOCK_ATTRIBUTE, &index_key)
            })
            .await?;

            for item in &items {
                collected.push(LeaderboardRecord::from_item(item)?);
            }
            block -= 1;
        }

        collected.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        collected.truncate(limit);

        tracing::debug!(score_key = %score_key, limit, returned = collected.len(), "top_n");
        Ok(collected)
    }

    /// Returns one user's record on a score key, if any.
    ///
    /// # Errors
    ///
    /// Returns a non-retryable backend error or a record decoding error.
    pub async fn get_user_score(
        &self,
        user_id: &str,
        score_key: &str,
    ) -> Result<Option<LeaderboardRecord>> {
        let key = ItemKey::new(user_id, score_key);
        let item = retry_throttled(&self.policy, "get_user_score", || {
            self.store.get(&self.table, &key, ReadConsistency::Strong)
        })
        .await?;

        item.as_ref().map(LeaderboardRecord::from_item).transpose()
    }

    /// Returns the records for many `(user_id, score_key)` pairs.
    ///
    /// Missing records are absent from the result; order is unspecified.
    ///
    /// # Errors
    ///
    /// Returns a non-retryable backend error or a record decoding error.
    pub async fn get_user_scores(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<LeaderboardRecord>> {
        let item_keys = keys
            .iter()
            .map(|(user_id, score_key)| ItemKey::new(user_id.as_str(), score_key.as_str()))
            .collect();

        let items = batch::get_all(self.store.as_ref(), &self.table, item_keys, &self.policy).await?;
        items.iter().map(LeaderboardRecord::from_item).collect()
    }
}
