//! Worker scaling: semaphore sizing and worker fan-out.
//!
//! The number of tokens bounds how many workers write concurrently, so it is
//! derived from the provisioned capacity of the leaderboard table:
//!
//! ```text
//! tokens = ceil(min(read_units, write_units) / per_worker_throughput)
//! ```
//!
//! Surplus tokens are only ever removed while free, so scaling down never
//! revokes a lease a worker is relying on.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;

use podium_core::{ProvisionedCapacity, TableBackend, WriteResult};

use crate::config::ScalerConfig;
use crate::error::Result;
use crate::invoker::WorkerInvoker;
use crate::metrics::PodiumMetrics;
use crate::retry::{retry_throttled, RetryPolicy};
use crate::semaphore::DistributedSemaphore;

/// Attempts for capacity introspection.
const DESCRIBE_ATTEMPTS: u32 = 5;

/// Returns the token count the given capacity supports.
#[must_use]
pub fn recommended_token_count(capacity: ProvisionedCapacity, per_worker_throughput: u64) -> usize {
    let tokens = capacity.limiting().div_ceil(per_worker_throughput.max(1));
    usize::try_from(tokens).unwrap_or(usize::MAX)
}

/// Returns how many workers to start for `free` tokens.
///
/// No free token means no spawn. Otherwise at least one and at most
/// `max_spawn` workers are started.
#[must_use]
pub fn spawn_target(free: usize, max_spawn: usize) -> usize {
    if free == 0 {
        return 0;
    }
    free.clamp(1, max_spawn.max(1))
}

/// What a reconcile pass observed and changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Tokens before the pass.
    pub current: usize,
    /// Tokens the capacity supports.
    pub recommended: usize,
    /// Tokens added.
    pub created: usize,
    /// Tokens removed.
    pub deleted: usize,
}

/// Sizes the semaphore and spawns workers.
pub struct WorkerScaler<S: TableBackend + ?Sized> {
    store: Arc<S>,
    capacity_table: String,
    semaphore: DistributedSemaphore<S>,
    config: ScalerConfig,
    metrics: PodiumMetrics,
}

impl<S: TableBackend + ?Sized> std::fmt::Debug for WorkerScaler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerScaler")
            .field("capacity_table", &self.capacity_table)
            .field("semaphore", &self.semaphore)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: TableBackend + ?Sized> WorkerScaler<S> {
    /// Creates a scaler sizing `semaphore` to the capacity of `capacity_table`.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        capacity_table: impl Into<String>,
        semaphore: DistributedSemaphore<S>,
        config: ScalerConfig,
    ) -> Self {
        Self {
            store,
            capacity_table: capacity_table.into(),
            semaphore,
            config,
            metrics: PodiumMetrics::new(),
        }
    }

    /// Returns the semaphore being sized.
    #[must_use]
    pub const fn semaphore(&self) -> &DistributedSemaphore<S> {
        &self.semaphore
    }

    /// Brings the token count in line with the table's capacity.
    ///
    /// Surplus is drawn from free tokens only, soonest to expire first (never
    /// leased first). A token leased between listing and deletion is skipped,
    /// so one pass may delete fewer than the surplus.
    ///
    /// # Errors
    ///
    /// Returns a backend error.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let policy = RetryPolicy::bounded(DESCRIBE_ATTEMPTS);
        let capacity = retry_throttled(&policy, "describe_capacity", || {
            self.store.describe_capacity(&self.capacity_table)
        })
        .await?;

        let recommended = recommended_token_count(capacity, self.config.per_worker_throughput);
        let tokens = self.semaphore.tokens().await?;
        let current = tokens.len();
        let mut created = 0;
        let mut deleted = 0;

        if recommended > current {
            created = self.semaphore.add_tokens(recommended - current).await?.len();
        } else if current > recommended {
            let now = Utc::now();
            let mut free: Vec<_> = tokens.into_iter().filter(|t| t.is_free_at(now)).collect();
            free.sort_by_key(|t| t.expires_at);

            for token in free.iter().take(current - recommended) {
                match self.semaphore.remove_free_token(token).await? {
                    WriteResult::Success => deleted += 1,
                    WriteResult::ConditionFailed => {
                        tracing::debug!(token_id = %token.token_id, "token leased during scale down");
                    }
                }
            }
        }

        let report = ReconcileReport {
            current,
            recommended,
            created,
            deleted,
        };
        tracing::info!(
            group = %self.semaphore.group_key(),
            read_units = capacity.read_units,
            write_units = capacity.write_units,
            current,
            recommended,
            created,
            deleted,
            "semaphore reconciled"
        );
        Ok(report)
    }

    /// Starts one worker per free token, see [`spawn_target`].
    ///
    /// Returns the number of invocations the platform accepted. Failed
    /// invocations are logged and not counted.
    ///
    /// # Errors
    ///
    /// Returns a backend error from counting free tokens.
    pub async fn spawn_more_workers<I: WorkerInvoker + ?Sized>(&self, invoker: &I) -> Result<usize> {
        let free = self.semaphore.count_free().await?;
        let target = spawn_target(free, self.config.max_spawn);
        if target == 0 {
            tracing::info!(free, "no free tokens, not spawning workers");
            return Ok(0);
        }

        let results = join_all((0..target).map(|_| invoker.invoke_self())).await;
        let mut spawned = 0;
        for result in results {
            match result {
                Ok(()) => spawned += 1,
                Err(e) => tracing::warn!(error = %e, "worker invocation failed"),
            }
        }

        self.metrics.record_workers_spawned(spawned as u64);
        tracing::info!(free, target, spawned, "spawned more workers");
        Ok(spawned)
    }
}
