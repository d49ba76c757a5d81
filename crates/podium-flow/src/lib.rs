//! # podium-flow
//!
//! Score ingestion and admission control for the Podium leaderboard store.
//!
//! This crate implements the write path on top of [`podium_core`]:
//!
//! - **Leaderboard Store**: Atomic score increments and top-N queries per
//!   facet combination
//! - **Score Pipeline**: Explodes raw events into every facet combination,
//!   compresses duplicates and writes them with bounded concurrency
//! - **Distributed Semaphore**: Lease-based admission control limiting how
//!   many workers write at once
//! - **Worker Scaling**: Sizes the semaphore to table capacity and fans out
//!   more workers while the queue keeps flowing
//!
//! ## Guarantees
//!
//! - **No lost increments**: Concurrent increments to the same record are
//!   serialized through compare-and-set
//! - **Bounded writers**: At most one admitted worker per semaphore token
//!   while leases are live
//! - **At-least-once**: Messages are acknowledged only after every update
//!   derived from them committed
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use chrono::Utc;
//! use podium_core::{FacetSet, MemoryTableBackend, TimeGranularity};
//! use podium_flow::config::{LeaderboardConfig, PipelineConfig};
//! use podium_flow::leaderboard::LeaderboardStore;
//! use podium_flow::pipeline::{InputScoreUpdate, ScorePipeline};
//!
//! # async fn example() -> podium_flow::Result<()> {
//! let backend = Arc::new(MemoryTableBackend::new());
//! let leaderboard = LeaderboardStore::new(backend, &LeaderboardConfig::default());
//! let pipeline = ScorePipeline::new(leaderboard, PipelineConfig::default());
//!
//! let event = InputScoreUpdate::new("u1", 50, Utc::now()).with_facet("location", ["melbourne"]);
//! let outcome = pipeline.update_scores(&[event]).await;
//! assert!(outcome.all_committed());
//!
//! let facets = FacetSet::new().with_time(TimeGranularity::AllTime, Utc::now());
//! let top = pipeline.leaderboard().top_n(&facets, 10).await?;
//! assert_eq!(top[0].user_id, "u1");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod batch;
pub mod config;
pub mod error;
pub mod invoker;
pub mod leaderboard;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod scaler;
pub mod semaphore;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{
        LeaderboardConfig, PipelineConfig, PodiumConfig, ScalerConfig, SemaphoreConfig,
        WorkerConfig,
    };
    pub use crate::error::{Error, Result};
    pub use crate::invoker::{RecordingInvoker, WorkerInvoker};
    pub use crate::leaderboard::{LeaderboardRecord, LeaderboardStore};
    pub use crate::metrics::PodiumMetrics;
    pub use crate::pipeline::{InputScoreUpdate, PipelineOutcome, ScorePipeline, ScoreUpdate};
    pub use crate::queue::{InMemoryQueue, MessageQueue, QueueMessage};
    pub use crate::retry::RetryPolicy;
    pub use crate::scaler::{ReconcileReport, WorkerScaler};
    pub use crate::semaphore::{
        Admission, AdmissionDecision, DistributedSemaphore, SemaphoreLease, SemaphoreToken,
    };
    pub use crate::worker::{ScoreWorker, WorkBudget, WorkerOutcome, WorkerReport};
}

pub use error::{Error, Result};
