//! The score worker: one stateless worker invocation.
//!
//! A worker invocation:
//!
//! 1. Obtains admission from the distributed semaphore. Denial ends the
//!    invocation without touching the queue or the leaderboard.
//! 2. While the remaining budget exceeds the safety margin, receives a batch
//!    of messages, decodes them and runs the pipeline. Before each batch the
//!    lease is renewed once less than half of it is left; a failed renewal
//!    stops the worker, since its token may already belong to another.
//! 3. Acknowledges every message whose updates all committed. Malformed
//!    messages are acknowledged too, since retrying them cannot succeed.
//!    Messages with a failed update stay unacknowledged and are redelivered.
//! 4. After the first batch that received messages, spawns more workers for
//!    the remaining free tokens.
//! 5. Releases admission and, if it stopped with messages possibly left,
//!    spawns more workers again so the queue keeps draining.
//!
//! ## Duplicate Delivery
//!
//! Increments are not idempotent. A message that is processed but whose
//! acknowledgement is lost is delivered again and counted twice. The queue's
//! at-least-once contract makes this an accepted source of double counting.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::Instrument;

use podium_core::observability::worker_span;
use podium_core::TableBackend;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::invoker::WorkerInvoker;
use crate::metrics::PodiumMetrics;
use crate::pipeline::{parse_input, ScorePipeline};
use crate::queue::{MessageQueue, QueueMessage, MAX_DELETE_BATCH};
use crate::scaler::WorkerScaler;
use crate::semaphore::{AdmissionDecision, SemaphoreLease};

/// Wall-clock time available to one invocation.
#[derive(Debug, Clone, Copy)]
pub struct WorkBudget {
    deadline: Instant,
}

impl WorkBudget {
    /// A budget ending `total` from now.
    #[must_use]
    pub fn new(total: Duration) -> Self {
        Self {
            deadline: Instant::now() + total,
        }
    }

    /// Returns the time left before the deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Why the drain loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// A receive round returned no messages.
    #[default]
    QueueEmpty,
    /// The remaining budget fell below the safety margin.
    BudgetExhausted,
    /// A batch had at least one failed update.
    UnitsFailed,
    /// The lease lapsed or was taken over before it could be renewed.
    LeaseLost,
}

/// Counters for one admitted invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Batches processed.
    pub batches: usize,
    /// Messages received.
    pub received: usize,
    /// Messages acknowledged after all their updates committed.
    pub acknowledged: usize,
    /// Malformed messages acknowledged without processing.
    pub dropped_malformed: usize,
    /// Messages left unacknowledged because an update failed.
    pub unacknowledged: usize,
    /// Why draining stopped.
    pub stop: StopReason,
    /// Workers spawned while and after draining.
    pub spawned: usize,
}

impl WorkerReport {
    /// Returns true if another worker is likely to find messages: at least
    /// one batch had messages and the queue was not seen empty.
    #[must_use]
    pub fn more_work_likely(&self) -> bool {
        self.batches > 0 && self.stop != StopReason::QueueEmpty
    }
}

/// Result of [`ScoreWorker::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// No semaphore token could be obtained; nothing was done.
    AdmissionDenied {
        /// Obtain attempts made.
        attempts: u32,
    },
    /// The worker was admitted and drained the queue.
    Drained(WorkerReport),
}

/// One stateless score worker.
pub struct ScoreWorker<S, Q, I>
where
    S: TableBackend + ?Sized,
    Q: MessageQueue + ?Sized,
    I: WorkerInvoker + ?Sized,
{
    worker_id: String,
    pipeline: ScorePipeline<S>,
    scaler: WorkerScaler<S>,
    queue: Arc<Q>,
    invoker: Arc<I>,
    config: WorkerConfig,
    metrics: PodiumMetrics,
}

impl<S, Q, I> std::fmt::Debug for ScoreWorker<S, Q, I>
where
    S: TableBackend + ?Sized,
    Q: MessageQueue + ?Sized,
    I: WorkerInvoker + ?Sized,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoreWorker")
            .field("worker_id", &self.worker_id)
            .field("pipeline", &self.pipeline)
            .field("scaler", &self.scaler)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, Q, I> ScoreWorker<S, Q, I>
where
    S: TableBackend + ?Sized,
    Q: MessageQueue + ?Sized,
    I: WorkerInvoker + ?Sized,
{
    /// Creates a worker with a fresh worker id.
    #[must_use]
    pub fn new(
        pipeline: ScorePipeline<S>,
        scaler: WorkerScaler<S>,
        queue: Arc<Q>,
        invoker: Arc<I>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            worker_id: ulid::Ulid::new().to_string(),
            pipeline,
            scaler,
            queue,
            invoker,
            config,
            metrics: PodiumMetrics::new(),
        }
    }

    /// Returns this worker's id.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Runs one invocation within the given budget.
    ///
    /// # Errors
    ///
    /// Returns a backend or queue error that stopped the invocation. Messages
    /// not yet acknowledged at that point are redelivered.
    pub async fn run(&self, budget: WorkBudget) -> Result<WorkerOutcome> {
        let semaphore = self.scaler.semaphore();
        let span = worker_span(&self.worker_id, semaphore.group_key());

        async {
            let mut lease = match semaphore.obtain().await? {
                AdmissionDecision::Granted(lease) => lease,
                AdmissionDecision::Denied { attempts } => {
                    tracing::info!(attempts, "admission denied, exiting");
                    return Ok(WorkerOutcome::AdmissionDenied { attempts });
                }
            };

            let drained = self.drain(budget, &mut lease).await;
            if let Err(e) = lease.release().await {
                tracing::warn!(error = %e, "failed to release semaphore");
            }
            let mut report = drained?;

            if report.more_work_likely() {
                tracing::info!(stop = ?report.stop, "messages likely remain, spawning more workers");
                report.spawned += self.fan_out().await;
            } else {
                tracing::info!(stop = ?report.stop, "finished draining, not spawning workers");
            }

            Ok(WorkerOutcome::Drained(report))
        }
        .instrument(span)
        .await
    }

    async fn drain(
        &self,
        budget: WorkBudget,
        lease: &mut SemaphoreLease<S>,
    ) -> Result<WorkerReport> {
        let margin = self.config.safety_margin();
        let mut report = WorkerReport::default();

        loop {
            if budget.remaining() <= margin {
                report.stop = StopReason::BudgetExhausted;
                break;
            }
            if lease.needs_renewal() && !lease.renew().await? {
                tracing::warn!(token_id = %lease.token_id(), "lease lost, stopping");
                report.stop = StopReason::LeaseLost;
                break;
            }

            let messages = self.receive().await?;
            if messages.is_empty() {
                report.stop = StopReason::QueueEmpty;
                break;
            }
            report.batches += 1;
            report.received += messages.len();

            let all_committed = self.process_batch(messages, &mut report).await;
            if report.batches == 1 {
                report.spawned += self.fan_out().await;
            }
            if !all_committed {
                report.stop = StopReason::UnitsFailed;
                break;
            }
        }

        tracing::info!(
            batches = report.batches,
            received = report.received,
            acknowledged = report.acknowledged,
            dropped = report.dropped_malformed,
            unacknowledged = report.unacknowledged,
            "drain finished"
        );
        Ok(report)
    }

    /// Spawns workers for free tokens. Failures are logged and count as zero.
    async fn fan_out(&self) -> usize {
        match self.scaler.spawn_more_workers(self.invoker.as_ref()).await {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::warn!(error = %e, "failed to spawn more workers");
                0
            }
        }
    }

    async fn receive(&self) -> Result<Vec<QueueMessage>> {
        let mut messages = Vec::new();
        for _ in 0..self.config.receive_rounds {
            let received = self.queue.receive(self.config.receive_batch_size).await?;
            if received.is_empty() {
                break;
            }
            messages.extend(received);
        }
        Ok(messages)
    }

    /// Processes one batch. Returns false if any update failed.
    async fn process_batch(&self, messages: Vec<QueueMessage>, report: &mut WorkerReport) -> bool {
        let mut events = Vec::with_capacity(messages.len());
        let mut owners = Vec::with_capacity(messages.len());
        let mut to_ack = Vec::new();
        let mut dropped = 0;

        for message in messages {
            match parse_input(&message.body, self.pipeline.config()) {
                Ok(event) => {
                    events.push(event);
                    owners.push(message.receipt);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed message");
                    to_ack.push(message.receipt);
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            self.metrics.record_malformed(dropped as u64);
        }

        let outcome = self.pipeline.update_scores(&events).await;
        let failed = outcome.failed_sources();
        let rejected: BTreeSet<usize> = outcome.rejected.iter().map(|r| r.position).collect();

        let mut committed = 0;
        for (position, receipt) in owners.into_iter().enumerate() {
            if failed.contains(&position) {
                continue;
            }
            if rejected.contains(&position) {
                dropped += 1;
            } else {
                committed += 1;
            }
            to_ack.push(receipt);
        }

        self.acknowledge(&to_ack).await;
        report.acknowledged += committed;
        report.dropped_malformed += dropped;
        report.unacknowledged += failed.len();

        outcome.all_committed()
    }

    /// Deletes messages in chunks. Failures are logged; those messages are
    /// redelivered.
    async fn acknowledge(&self, receipts: &[String]) {
        let chunks: Vec<&[String]> = receipts.chunks(MAX_DELETE_BATCH).collect();
        let results = join_all(chunks.iter().map(|chunk| self.queue.delete_batch(chunk))).await;

        let mut deleted = 0;
        for (chunk, result) in chunks.iter().zip(results) {
            match result {
                Ok(output) => {
                    if !output.failed.is_empty() {
                        tracing::warn!(failed = output.failed.len(), "some deletes failed");
                    }
                    deleted += chunk.len().saturating_sub(output.failed.len());
                }
                Err(e) => tracing::warn!(error = %e, "delete batch failed"),
            }
        }
        self.metrics.record_acknowledged(deleted as u64);
    }
}
