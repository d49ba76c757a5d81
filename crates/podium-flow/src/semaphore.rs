//! Lease-based distributed semaphore.
//!
//! The semaphore is a group of tokens stored in a table, one item per token.
//! A token is **held** while its `expiresAt` lies in the future and **free**
//! when `expiresAt` is null or in the past. Expiry is a predicate evaluated at
//! read and write time, so a crashed holder frees its token without any
//! cleanup action.
//!
//! ## Protocol
//!
//! - **Obtain**: list the group's tokens, pick a random free one, and set its
//!   `expiresAt` to `now + lease` under the condition that it still exists and
//!   is still free. Up to `max_attempts` tries with linear jittered backoff.
//! - **Renew**: move `expiresAt` one lease term past now under the condition
//!   that it still carries this lease's expiry. A holder that writes for longer
//!   than one term renews before the lease lapses and stops writing if the
//!   renewal fails.
//! - **Release**: clear `expiresAt` under the condition that it still carries
//!   this lease's expiry. A lease that lapsed and was taken by another worker is
//!   never cleared.
//!
//! At most as many workers as there are tokens hold a lease at any instant.
//!
//! ## Example
//!
//! ```rust
//! # async fn demo() -> podium_flow::Result<()> {
//! use std::sync::Arc;
//! use podium_core::MemoryTableBackend;
//! use podium_flow::config::SemaphoreConfig;
//! use podium_flow::semaphore::{Admission, DistributedSemaphore};
//!
//! let semaphore = DistributedSemaphore::new(
//!     Arc::new(MemoryTableBackend::new()),
//!     &SemaphoreConfig::default(),
//! );
//! semaphore.add_tokens(2).await?;
//!
//! match semaphore.with_admission(|| async { 42 }).await? {
//!     Admission::Granted(answer) => assert_eq!(answer, 42),
//!     Admission::Denied { .. } => unreachable!("a token is free"),
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use podium_core::{Item, ItemKey, TableBackend, WriteCondition, WriteResult};

use crate::batch;
use crate::config::SemaphoreConfig;
use crate::error::{Error, Result};
use crate::metrics::PodiumMetrics;
use crate::retry::{jitter, retry_throttled, RetryPolicy};

/// Attribute holding a token's lease expiry in epoch milliseconds.
pub const EXPIRES_AT_ATTRIBUTE: &str = "expiresAt";

/// Backoff unit between obtain attempts; attempt `n` waits up to `n` units.
const OBTAIN_BACKOFF_UNIT: Duration = Duration::from_millis(100);

/// Attempts for token listing reads outside of obtain.
const READ_ATTEMPTS: u32 = 5;

/// One admission token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemaphoreToken {
    /// Token group.
    pub group_key: String,
    /// Token identifier, unique within the group.
    pub token_id: String,
    /// Lease expiry; `None` means never leased or released.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SemaphoreToken {
    /// Creates a free token.
    #[must_use]
    pub fn free(group_key: impl Into<String>, token_id: impl Into<String>) -> Self {
        Self {
            group_key: group_key.into(),
            token_id: token_id.into(),
            expires_at: None,
        }
    }

    /// Returns true if the token is free at `now`.
    #[must_use]
    pub fn is_free_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires| now > expires)
    }

    /// Returns the table key of this token.
    #[must_use]
    pub fn item_key(&self) -> ItemKey {
        ItemKey::new(self.group_key.clone(), self.token_id.clone())
    }

    fn from_item(item: &Item) -> Result<Self> {
        Ok(item.to_value()?)
    }
}

/// Outcome of [`DistributedSemaphore::obtain`].
pub enum AdmissionDecision<S: TableBackend + ?Sized> {
    /// A token was leased.
    Granted(SemaphoreLease<S>),
    /// No token could be leased within the attempt budget.
    Denied {
        /// Attempts made.
        attempts: u32,
    },
}

impl<S: TableBackend + ?Sized> fmt::Debug for AdmissionDecision<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Granted(lease) => f.debug_tuple("Granted").field(lease).finish(),
            Self::Denied { attempts } => f
                .debug_struct("Denied")
                .field("attempts", attempts)
                .finish(),
        }
    }
}

/// Outcome of [`DistributedSemaphore::with_admission`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission<T> {
    /// The body ran under a lease and produced this value.
    Granted(T),
    /// No lease was obtained; the body did not run.
    Denied {
        /// Attempts made.
        attempts: u32,
    },
}

impl<T> Admission<T> {
    /// Returns true if the body ran.
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Distributed counting semaphore over a table backend.
pub struct DistributedSemaphore<S: TableBackend + ?Sized> {
    store: Arc<S>,
    table: String,
    group_key: String,
    lease: Duration,
    renew_below: Duration,
    max_attempts: u32,
    metrics: PodiumMetrics,
}

impl<S: TableBackend + ?Sized> Clone for DistributedSemaphore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            table: self.table.clone(),
            group_key: self.group_key.clone(),
            lease: self.lease,
            renew_below: self.renew_below,
            max_attempts: self.max_attempts,
            metrics: self.metrics,
        }
    }
}

impl<S: TableBackend + ?Sized> fmt::Debug for DistributedSemaphore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedSemaphore")
            .field("table", &self.table)
            .field("group_key", &self.group_key)
            .field("lease", &self.lease)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl<S: TableBackend + ?Sized> DistributedSemaphore<S> {
    /// Creates a semaphore handle for the configured token group.
    #[must_use]
    pub fn new(store: Arc<S>, config: &SemaphoreConfig) -> Self {
        Self {
            store,
            table: config.table.clone(),
            group_key: config.group_key.clone(),
            lease: config.lease(),
            renew_below: config.renewal_threshold(),
            max_attempts: config.max_attempts.max(1),
            metrics: PodiumMetrics::new(),
        }
    }

    /// Returns the token group key.
    #[must_use]
    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    /// Returns every token of the group.
    ///
    /// # Errors
    ///
    /// Returns a backend error or a token decoding error.
    pub async fn tokens(&self) -> Result<Vec<SemaphoreToken>> {
        let policy = RetryPolicy::bounded(READ_ATTEMPTS);
        let items = retry_throttled(&policy, "semaphore_tokens", || {
            self.store.query(&self.table, &self.group_key)
        })
        .await?;
        items.iter().map(SemaphoreToken::from_item).collect()
    }

    /// Returns the number of tokens free right now.
    ///
    /// # Errors
    ///
    /// Returns a backend error or a token decoding error.
    pub async fn count_free(&self) -> Result<usize> {
        let now = Utc::now();
        let tokens = self.tokens().await?;
        let free = tokens.iter().filter(|t| t.is_free_at(now)).count();
        self.metrics.set_token_counts(tokens.len(), free);
        Ok(free)
    }

    /// Tries to lease a free token.
    ///
    /// Throttling consumes an attempt. Exhausting the attempts is
    /// [`AdmissionDecision::Denied`], not an error.
    ///
    /// # Errors
    ///
    /// Returns a non-throttling backend error.
    pub async fn obtain(&self) -> Result<AdmissionDecision<S>> {
        let mut tried = HashSet::new();

        for attempt in 1..=self.max_attempts {
            match self.try_obtain(&mut tried).await {
                Ok(Some(lease)) => {
                    self.metrics.record_admission("granted");
                    tracing::debug!(
                        group = %self.group_key,
                        token_id = %lease.token_id(),
                        attempt,
                        "semaphore obtained"
                    );
                    return Ok(AdmissionDecision::Granted(lease));
                }
                Ok(None) => {
                    tracing::debug!(group = %self.group_key, attempt, "no free token taken");
                }
                Err(e) if e.is_throttled() => {
                    self.metrics.record_throttle("semaphore_obtain");
                    tracing::debug!(group = %self.group_key, attempt, "obtain throttled");
                }
                Err(e) => return Err(e),
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(jitter(OBTAIN_BACKOFF_UNIT * attempt)).await;
            }
        }

        self.metrics.record_admission("denied");
        tracing::info!(
            group = %self.group_key,
            attempts = self.max_attempts,
            "semaphore not obtained"
        );
        Ok(AdmissionDecision::Denied {
            attempts: self.max_attempts,
        })
    }

    /// One obtain attempt. `None` means nothing was taken.
    async fn try_obtain(&self, tried: &mut HashSet<String>) -> Result<Option<SemaphoreLease<S>>> {
        let now = Utc::now();
        let items = self.store.query(&self.table, &self.group_key).await?;
        let mut free = Vec::new();
        for item in &items {
            let token = SemaphoreToken::from_item(item)?;
            if token.is_free_at(now) && !tried.contains(&token.token_id) {
                free.push(token);
            }
        }

        let picked = free.choose(&mut rand::thread_rng()).cloned();
        let Some(token) = picked else {
            return Ok(None);
        };
        tried.insert(token.token_id.clone());

        let lease = chrono::Duration::from_std(self.lease)
            .map_err(|_| Error::configuration("lease duration out of range"))?;
        let expires_at = now + lease;
        let key = token.item_key();

        let result = self
            .store
            .update_attribute(
                &self.table,
                &key,
                EXPIRES_AT_ATTRIBUTE,
                Value::from(expires_at.timestamp_millis()),
                WriteCondition::LeaseFree {
                    attribute: EXPIRES_AT_ATTRIBUTE.into(),
                    now_millis: now.timestamp_millis(),
                },
            )
            .await?;

        Ok(match result {
            WriteResult::Success => Some(SemaphoreLease {
                store: Arc::clone(&self.store),
                table: self.table.clone(),
                key,
                expires_at,
                term: self.lease,
                renew_below: self.renew_below,
                released: false,
            }),
            WriteResult::ConditionFailed => None,
        })
    }

    /// Releases a lease. See [`SemaphoreLease::release`].
    ///
    /// # Errors
    ///
    /// Returns a backend error.
    pub async fn release(&self, lease: SemaphoreLease<S>) -> Result<()> {
        lease.release().await
    }

    /// Runs `body` while holding a lease.
    ///
    /// The lease is released when the body completes. If the returned future
    /// is dropped or the body panics, the lease is released on drop (best
    /// effort), and otherwise lapses at its expiry.
    ///
    /// # Errors
    ///
    /// Returns a backend error from obtaining the lease. Release failures are
    /// logged, not returned.
    pub async fn with_admission<F, Fut, T>(&self, body: F) -> Result<Admission<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = match self.obtain().await? {
            AdmissionDecision::Granted(lease) => lease,
            AdmissionDecision::Denied { attempts } => return Ok(Admission::Denied { attempts }),
        };

        let value = body().await;

        if let Err(e) = lease.release().await {
            tracing::warn!(group = %self.group_key, error = %e, "failed to release semaphore");
        }
        Ok(Admission::Granted(value))
    }

    /// Adds `count` free tokens to the group.
    ///
    /// # Errors
    ///
    /// Returns a backend error.
    pub async fn add_tokens(&self, count: usize) -> Result<Vec<SemaphoreToken>> {
        let tokens: Vec<SemaphoreToken> = (0..count)
            .map(|_| SemaphoreToken::free(self.group_key.clone(), ulid::Ulid::new().to_string()))
            .collect();
        let items = tokens
            .iter()
            .map(|t| Ok(Item::from_value(t.item_key(), t)?))
            .collect::<Result<Vec<_>>>()?;

        batch::put_all(
            self.store.as_ref(),
            &self.table,
            items,
            &RetryPolicy::bounded(READ_ATTEMPTS),
        )
        .await?;
        Ok(tokens)
    }

    /// Deletes a token if it is still free.
    ///
    /// Returns [`WriteResult::ConditionFailed`] if the token was leased or
    /// already deleted.
    ///
    /// # Errors
    ///
    /// Returns a backend error.
    pub async fn remove_free_token(&self, token: &SemaphoreToken) -> Result<WriteResult> {
        let condition = WriteCondition::LeaseFree {
            attribute: EXPIRES_AT_ATTRIBUTE.into(),
            now_millis: Utc::now().timestamp_millis(),
        };
        Ok(self
            .store
            .delete(&self.table, &token.item_key(), condition)
            .await?)
    }
}

/// A held token.
///
/// Dropping an unreleased lease spawns a best-effort release on the current
/// Tokio runtime. Without a runtime the lease simply lapses at its expiry.
pub struct SemaphoreLease<S: TableBackend + ?Sized> {
    store: Arc<S>,
    table: String,
    key: ItemKey,
    expires_at: DateTime<Utc>,
    term: Duration,
    renew_below: Duration,
    released: bool,
}

impl<S: TableBackend + ?Sized> fmt::Debug for SemaphoreLease<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreLease")
            .field("table", &self.table)
            .field("key", &self.key)
            .field("expires_at", &self.expires_at)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<S: TableBackend + ?Sized> SemaphoreLease<S> {
    /// Returns the leased token id.
    #[must_use]
    pub fn token_id(&self) -> &str {
        &self.key.sort
    }

    /// Returns when the lease lapses.
    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Returns the time left before the lease lapses.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Returns true once less than the renewal threshold is left.
    #[must_use]
    pub fn needs_renewal(&self) -> bool {
        self.remaining() <= self.renew_below
    }

    /// Extends the lease to one full term from now.
    ///
    /// Returns false if the lease already lapsed, or the token was taken over
    /// or removed. The holder is no longer admitted and must stop writing.
    /// Throttled renewals are retried a bounded number of times.
    ///
    /// # Errors
    ///
    /// Returns a backend error.
    pub async fn renew(&mut self) -> Result<bool> {
        let now = Utc::now();
        if now >= self.expires_at {
            tracing::info!(token_id = %self.key.sort, "lease lapsed before renewal");
            return Ok(false);
        }

        let term = chrono::Duration::from_std(self.term)
            .map_err(|_| Error::configuration("lease duration out of range"))?;
        let expires_at = now + term;
        let held = self.expires_at.timestamp_millis();

        let policy = RetryPolicy::bounded(READ_ATTEMPTS);
        let result = retry_throttled(&policy, "semaphore_renew", || {
            self.store.update_attribute(
                &self.table,
                &self.key,
                EXPIRES_AT_ATTRIBUTE,
                Value::from(expires_at.timestamp_millis()),
                WriteCondition::attribute_equals(EXPIRES_AT_ATTRIBUTE, held),
            )
        })
        .await?;

        match result {
            WriteResult::Success => {
                self.expires_at = expires_at;
                tracing::debug!(token_id = %self.key.sort, %expires_at, "lease renewed");
                Ok(true)
            }
            WriteResult::ConditionFailed => {
                tracing::info!(token_id = %self.key.sort, "lease taken over before renewal");
                Ok(false)
            }
        }
    }

    /// Releases the lease.
    ///
    /// A token that vanished, or that lapsed and was leased again by another
    /// worker, is left untouched and is not an error.
    ///
    /// # Errors
    ///
    /// Returns a backend error.
    pub async fn release(mut self) -> Result<()> {
        let result = release_token(
            self.store.as_ref(),
            &self.table,
            &self.key,
            self.expires_at,
        )
        .await;
        self.released = true;

        match result? {
            WriteResult::Success => {
                tracing::debug!(token_id = %self.key.sort, "semaphore released");
            }
            WriteResult::ConditionFailed => {
                tracing::debug!(token_id = %self.key.sort, "lease already lapsed or token removed");
            }
        }
        Ok(())
    }
}

async fn release_token<S: TableBackend + ?Sized>(
    store: &S,
    table: &str,
    key: &ItemKey,
    expires_at: DateTime<Utc>,
) -> Result<WriteResult> {
    Ok(store
        .update_attribute(
            table,
            key,
            EXPIRES_AT_ATTRIBUTE,
            Value::Null,
            WriteCondition::attribute_equals(EXPIRES_AT_ATTRIBUTE, expires_at.timestamp_millis()),
        )
        .await?)
}

impl<S: TableBackend + ?Sized> Drop for SemaphoreLease<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let store = Arc::clone(&self.store);
        let table = self.table.clone();
        let key = self.key.clone();
        let expires_at = self.expires_at;

        handle.spawn(async move {
            if let Err(e) = release_token(store.as_ref(), &table, &key, expires_at).await {
                tracing::warn!(token_id = %key.sort, error = %e, "drop release failed");
            }
        });
    }
}
