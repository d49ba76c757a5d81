//! Runtime configuration for Podium components.
//!
//! Every section has production defaults and can be deserialized with serde.
//! [`PodiumConfig::from_env`] overlays `PODIUM_*` environment variables on top
//! of the defaults:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `PODIUM_LEADERBOARD_TABLE` | [`LeaderboardConfig::table`] |
//! | `PODIUM_MAX_RECOGNIZABLE_SCORE` | [`LeaderboardConfig::max_recognizable_score`] |
//! | `PODIUM_MAX_WRITE_ATTEMPTS` | [`LeaderboardConfig::max_write_attempts`] |
//! | `PODIUM_GRANULARITIES` | [`PipelineConfig::granularities`] (comma separated) |
//! | `PODIUM_PIPELINE_CONCURRENCY` | [`PipelineConfig::concurrency`] |
//! | `PODIUM_MAX_UPDATES_PER_EVENT` | [`PipelineConfig::max_updates_per_event`] |
//! | `PODIUM_SEMAPHORE_TABLE` | [`SemaphoreConfig::table`] |
//! | `PODIUM_SEMAPHORE_GROUP` | [`SemaphoreConfig::group_key`] |
//! | `PODIUM_LEASE_SECS` | [`SemaphoreConfig::lease_secs`] |
//! | `PODIUM_OBTAIN_ATTEMPTS` | [`SemaphoreConfig::max_attempts`] |
//! | `PODIUM_WORKER_THROUGHPUT` | [`ScalerConfig::per_worker_throughput`] |
//! | `PODIUM_MAX_SPAWN` | [`ScalerConfig::max_spawn`] |
//! | `PODIUM_RECEIVE_BATCH_SIZE` | [`WorkerConfig::receive_batch_size`] |
//! | `PODIUM_RECEIVE_ROUNDS` | [`WorkerConfig::receive_rounds`] |
//! | `PODIUM_SAFETY_MARGIN_SECS` | [`WorkerConfig::safety_margin_secs`] |
//! | `PODIUM_LOG_FORMAT` | [`PodiumConfig::log_format`] (`json` or `pretty`) |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use podium_core::{LogFormat, TimeGranularity, DEFAULT_MAX_RECOGNIZABLE_SCORE};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Leaderboard table settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderboardConfig {
    /// Leaderboard table name.
    pub table: String,
    /// Highest score reachable by a top-N read.
    pub max_recognizable_score: i64,
    /// Attempts per increment before giving up; `None` retries forever.
    pub max_write_attempts: Option<u32>,
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self {
            table: "leaderboard".into(),
            max_recognizable_score: DEFAULT_MAX_RECOGNIZABLE_SCORE,
            max_write_attempts: None,
        }
    }
}

impl LeaderboardConfig {
    /// Returns the retry policy for increments and reads.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.max_write_attempts
            .map_or_else(RetryPolicy::unbounded, RetryPolicy::bounded)
    }
}

/// Update pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Time windows every event is exploded into.
    pub granularities: Vec<TimeGranularity>,
    /// Maximum concurrently executing writes.
    pub concurrency: usize,
    /// Maximum candidate updates a single event may explode into.
    pub max_updates_per_event: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            granularities: TimeGranularity::ALL.to_vec(),
            concurrency: 8,
            max_updates_per_event: 1024,
        }
    }
}

/// Distributed semaphore settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemaphoreConfig {
    /// Semaphore table name.
    pub table: String,
    /// Token group guarded by this semaphore.
    pub group_key: String,
    /// Lease length in seconds.
    pub lease_secs: u64,
    /// Attempts per obtain.
    pub max_attempts: u32,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            table: "semaphore".into(),
            group_key: "score-writers".into(),
            lease_secs: 60,
            max_attempts: 3,
        }
    }
}

impl SemaphoreConfig {
    /// Returns the lease length.
    #[must_use]
    pub const fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    /// Remaining lease time at which a holder renews: half the lease.
    ///
    /// One batch of work must complete within this window, or the lease can
    /// lapse while the batch is still writing.
    #[must_use]
    pub const fn renewal_threshold(&self) -> Duration {
        Duration::from_millis(self.lease_secs.saturating_mul(500))
    }
}

/// Worker scaler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    /// Capacity units one worker consumes.
    pub per_worker_throughput: u64,
    /// Maximum workers spawned per scaling decision.
    pub max_spawn: usize,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            per_worker_throughput: 200,
            max_spawn: 5,
        }
    }
}

/// Score worker settings.
///
/// The safety margin and the semaphore lease bound different clocks. The
/// margin is measured against the invocation's wall-clock budget and stops
/// the worker pulling new batches when the budget is nearly spent. The lease
/// is renewed between batches whenever less than
/// [`SemaphoreConfig::renewal_threshold`] is left, so a margin longer than
/// the lease (240s against 60s by default) is expected and does not let a
/// lease lapse while the worker is still writing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Messages requested per receive call.
    pub receive_batch_size: usize,
    /// Receive calls per drain iteration.
    pub receive_rounds: usize,
    /// Remaining budget below which no new work is pulled, in seconds.
    pub safety_margin_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            receive_batch_size: 10,
            receive_rounds: 1,
            safety_margin_secs: 240,
        }
    }
}

impl WorkerConfig {
    /// Returns the safety margin.
    #[must_use]
    pub const fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }
}

/// Aggregated configuration for a Podium deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodiumConfig {
    /// Leaderboard table settings.
    pub leaderboard: LeaderboardConfig,
    /// Pipeline settings.
    pub pipeline: PipelineConfig,
    /// Semaphore settings.
    pub semaphore: SemaphoreConfig,
    /// Scaler settings.
    pub scaler: ScalerConfig,
    /// Worker settings.
    pub worker: WorkerConfig,
    /// Log output format.
    #[serde(with = "log_format_serde")]
    pub log_format: LogFormat,
}

impl PodiumConfig {
    /// Loads configuration from `PODIUM_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a variable is set to an invalid value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(table) = lookup("PODIUM_LEADERBOARD_TABLE") {
            config.leaderboard.table = table;
        }
        if let Some(v) = parse_var(&lookup, "PODIUM_MAX_RECOGNIZABLE_SCORE")? {
            config.leaderboard.max_recognizable_score = v;
        }
        if let Some(v) = parse_var(&lookup, "PODIUM_MAX_WRITE_ATTEMPTS")? {
            config.leaderboard.max_write_attempts = Some(v);
        }

        if let Some(raw) = lookup("PODIUM_GRANULARITIES") {
            config.pipeline.granularities = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    TimeGranularity::from_str(s).map_err(|e| {
                        Error::configuration(format!("invalid PODIUM_GRANULARITIES: {e}"))
                    })
                })
                .collect::<Result<_>>()?;
        }
        if let Some(v) = parse_var(&lookup, "PODIUM_PIPELINE_CONCURRENCY")? {
            config.pipeline.concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "PODIUM_MAX_UPDATES_PER_EVENT")? {
            config.pipeline.max_updates_per_event = v;
        }

        if let Some(table) = lookup("PODIUM_SEMAPHORE_TABLE") {
            config.semaphore.table = table;
        }
        if let Some(group) = lookup("PODIUM_SEMAPHORE_GROUP") {
            config.semaphore.group_key = group;
        }
        if let Some(v) = parse_var(&lookup, "PODIUM_LEASE_SECS")? {
            config.semaphore.lease_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "PODIUM_OBTAIN_ATTEMPTS")? {
            config.semaphore.max_attempts = v;
        }

        if let Some(v) = parse_var(&lookup, "PODIUM_WORKER_THROUGHPUT")? {
            config.scaler.per_worker_throughput = v;
        }
        if let Some(v) = parse_var(&lookup, "PODIUM_MAX_SPAWN")? {
            config.scaler.max_spawn = v;
        }

        if let Some(v) = parse_var(&lookup, "PODIUM_RECEIVE_BATCH_SIZE")? {
            config.worker.receive_batch_size = v;
        }
        if let Some(v) = parse_var(&lookup, "PODIUM_RECEIVE_ROUNDS")? {
            config.worker.receive_rounds = v;
        }
        if let Some(v) = parse_var(&lookup, "PODIUM_SAFETY_MARGIN_SECS")? {
            config.worker.safety_margin_secs = v;
        }

        if let Some(raw) = lookup("PODIUM_LOG_FORMAT") {
            config.log_format = raw
                .parse()
                .map_err(|_| Error::configuration("invalid PODIUM_LOG_FORMAT"))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.leaderboard.max_recognizable_score < 1 {
            return Err(Error::configuration("max_recognizable_score must be positive"));
        }
        if self.leaderboard.max_write_attempts == Some(0) {
            return Err(Error::configuration("max_write_attempts must be at least 1"));
        }
        if self.pipeline.granularities.is_empty() {
            return Err(Error::configuration("at least one granularity is required"));
        }
        if self.pipeline.concurrency == 0 {
            return Err(Error::configuration("pipeline concurrency must be at least 1"));
        }
        if self.pipeline.max_updates_per_event == 0 {
            return Err(Error::configuration("max_updates_per_event must be at least 1"));
        }
        if self.semaphore.lease_secs == 0 {
            return Err(Error::configuration("lease_secs must be at least 1"));
        }
        if self.semaphore.max_attempts == 0 {
            return Err(Error::configuration("obtain max_attempts must be at least 1"));
        }
        if self.scaler.per_worker_throughput == 0 {
            return Err(Error::configuration("per_worker_throughput must be at least 1"));
        }
        if self.worker.receive_batch_size == 0 || self.worker.receive_rounds == 0 {
            return Err(Error::configuration("worker receive sizes must be at least 1"));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| Error::configuration(format!("invalid {key}: {raw}")))
        })
        .transpose()
}

mod log_format_serde {
    use podium_core::LogFormat;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(format: &LogFormat, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(format)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LogFormat, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
