//! Pre-built test fixtures for common test scenarios.
//!
//! Provides a wired-up [`TestContext`] and factory functions for score events.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use podium_core::ProvisionedCapacity;
use podium_flow::config::PodiumConfig;
use podium_flow::invoker::RecordingInvoker;
use podium_flow::leaderboard::LeaderboardStore;
use podium_flow::pipeline::{InputScoreUpdate, ScorePipeline};
use podium_flow::queue::InMemoryQueue;
use podium_flow::scaler::WorkerScaler;
use podium_flow::semaphore::DistributedSemaphore;
use podium_flow::worker::ScoreWorker;

use crate::storage::TracingTableBackend;

/// Worker type wired by [`TestContext::worker`].
pub type TestWorker = ScoreWorker<TracingTableBackend, InMemoryQueue, RecordingInvoker>;

/// Test context with a shared backend, queue and invoker.
pub struct TestContext {
    /// Shared table backend.
    pub backend: Arc<TracingTableBackend>,
    /// Shared message queue.
    pub queue: Arc<InMemoryQueue>,
    /// Shared worker invoker.
    pub invoker: Arc<RecordingInvoker>,
    /// Settings every component is built from.
    pub config: PodiumConfig,
}

impl TestContext {
    /// Creates a context with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PodiumConfig::default())
    }

    /// Creates a context with the given settings.
    #[must_use]
    pub fn with_config(config: PodiumConfig) -> Self {
        Self {
            backend: Arc::new(TracingTableBackend::new()),
            queue: Arc::new(InMemoryQueue::new()),
            invoker: Arc::new(RecordingInvoker::new()),
            config,
        }
    }

    /// Sets the leaderboard table capacity seen by the scaler.
    pub fn set_capacity(&self, read_units: u64, write_units: u64) {
        self.backend.set_capacity(
            &self.config.leaderboard.table,
            ProvisionedCapacity::new(read_units, write_units),
        );
    }

    /// Returns a leaderboard store over the shared backend.
    #[must_use]
    pub fn leaderboard(&self) -> LeaderboardStore<TracingTableBackend> {
        LeaderboardStore::new(Arc::clone(&self.backend), &self.config.leaderboard)
    }

    /// Returns a pipeline over the shared backend.
    #[must_use]
    pub fn pipeline(&self) -> ScorePipeline<TracingTableBackend> {
        ScorePipeline::new(self.leaderboard(), self.config.pipeline.clone())
    }

    /// Returns a semaphore handle over the shared backend.
    #[must_use]
    pub fn semaphore(&self) -> DistributedSemaphore<TracingTableBackend> {
        DistributedSemaphore::new(Arc::clone(&self.backend), &self.config.semaphore)
    }

    /// Returns a scaler sized against the leaderboard table.
    #[must_use]
    pub fn scaler(&self) -> WorkerScaler<TracingTableBackend> {
        WorkerScaler::new(
            Arc::clone(&self.backend),
            self.config.leaderboard.table.clone(),
            self.semaphore(),
            self.config.scaler.clone(),
        )
    }

    /// Returns a worker over the shared backend, queue and invoker.
    #[must_use]
    pub fn worker(&self) -> TestWorker {
        ScoreWorker::new(
            self.pipeline(),
            self.scaler(),
            Arc::clone(&self.queue),
            Arc::clone(&self.invoker),
            self.config.worker.clone(),
        )
    }

    /// Enqueues events as JSON messages.
    pub fn enqueue(&self, events: &[InputScoreUpdate]) {
        for event in events {
            self.queue.send(event_json(event)).expect("send");
        }
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed instant: 2021-03-15 13:45:30 UTC.
#[must_use]
pub fn fixed_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 3, 15, 13, 45, 30)
        .single()
        .expect("valid date")
}

/// A score event with no generic dimensions at [`fixed_date`].
#[must_use]
pub fn score_event(user_id: &str, score: i64) -> InputScoreUpdate {
    InputScoreUpdate::new(user_id, score, fixed_date())
}

/// The event used across end-to-end tests: location and tag dimensions.
#[must_use]
pub fn tagged_event(user_id: &str, score: i64) -> InputScoreUpdate {
    score_event(user_id, score)
        .with_facet("location", ["melbourne"])
        .with_facet("tags", ["aws", "ec2"])
}

/// Serializes an event to its wire payload.
#[must_use]
pub fn event_json(event: &InputScoreUpdate) -> String {
    serde_json::to_string(event).expect("serialize event")
}
