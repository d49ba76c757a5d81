//! The score update pipeline.
//!
//! A batch of input events flows through five stages:
//!
//! ```text
//! validate -> explode -> compress -> schedule -> execute
//! ```
//!
//! - **Validate** rejects malformed events before they reach the store.
//! - **Explode** turns one event into a candidate update for every facet
//!   combination it contributes to.
//! - **Compress** merges candidates of the same `(user, combination)` so each
//!   leaderboard row is written at most once per batch.
//! - **Schedule** wraps each merged update in a deferred unit of work, in
//!   shuffled order so concurrent workers do not contend on the same rows in
//!   lockstep.
//! - **Execute** runs the units with bounded concurrency. A failed unit never
//!   aborts its siblings; failures are reported with the batch positions of the
//!   events they came from.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use podium_core::observability::pipeline_span;
use podium_core::facet::{is_dimension_key, is_dimension_value};
use podium_core::{FacetSet, TableBackend, TimeGranularity};
use tracing::Instrument;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::leaderboard::{LeaderboardRecord, LeaderboardStore};
use crate::metrics::{time_pipeline_run, PodiumMetrics};

/// A score increment as received from ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputScoreUpdate {
    /// User identifier.
    pub user_id: String,
    /// Signed score delta.
    pub score: i64,
    /// Event time, serialized as epoch milliseconds.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub date: DateTime<Utc>,
    /// Raw values per non-time dimension.
    #[serde(default)]
    pub input_facets: BTreeMap<String, Vec<String>>,
}

impl InputScoreUpdate {
    /// Creates an event with no dimensions.
    #[must_use]
    pub fn new(user_id: impl Into<String>, score: i64, date: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            score,
            date,
            input_facets: BTreeMap::new(),
        }
    }

    /// Adds values for a dimension (builder style).
    #[must_use]
    pub fn with_facet<I, V>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.input_facets
            .entry(key.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Returns how many candidate updates this event explodes into.
    ///
    /// Returns `None` on overflow.
    #[must_use]
    pub fn explosion_size(&self, granularities: usize) -> Option<usize> {
        self.input_facets
            .values()
            .try_fold(granularities, |acc, values| acc.checked_mul(values.len() + 1))
    }

    /// Checks that this event is well-formed under the given pipeline settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] describing the first problem found.
    pub fn validate(&self, config: &PipelineConfig) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(Error::malformed("empty user id"));
        }

        for (key, values) in &self.input_facets {
            if key.is_empty() {
                return Err(Error::malformed("empty dimension key"));
            }
            if !is_dimension_key(key) {
                return Err(Error::malformed(format!(
                    "dimension key {key:?} contains a key delimiter"
                )));
            }
            if TimeGranularity::is_granularity_key(key) {
                return Err(Error::malformed(format!(
                    "dimension key {key:?} collides with a time granularity"
                )));
            }
            if values.iter().any(String::is_empty) {
                return Err(Error::malformed(format!("empty value for dimension {key:?}")));
            }
            if let Some(value) = values.iter().find(|v| !is_dimension_value(v)) {
                return Err(Error::malformed(format!(
                    "value {value:?} for dimension {key:?} contains a key delimiter"
                )));
            }
        }

        match self.explosion_size(config.granularities.len()) {
            Some(n) if n <= config.max_updates_per_event => Ok(()),
            Some(n) => Err(Error::malformed(format!(
                "event explodes into {n} updates, limit is {}",
                config.max_updates_per_event
            ))),
            None => Err(Error::malformed("event explosion size overflows")),
        }
    }
}

/// Decodes and validates one raw queue payload.
///
/// # Errors
///
/// Returns [`Error::MalformedInput`] if the payload is not a valid event.
pub fn parse_input(payload: &str, config: &PipelineConfig) -> Result<InputScoreUpdate> {
    let event: InputScoreUpdate = serde_json::from_str(payload)
        .map_err(|e| Error::malformed(format!("undecodable event: {e}")))?;
    event.validate(config)?;
    Ok(event)
}

/// One candidate write against a single facet combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreUpdate {
    /// User identifier.
    pub user_id: String,
    /// Score delta.
    pub score: i64,
    /// Facet combination the delta applies to.
    pub facets: FacetSet,
    /// Batch positions of the input events this update was derived from.
    pub sources: BTreeSet<usize>,
}

impl ScoreUpdate {
    /// Returns the canonical key of this update's combination.
    #[must_use]
    pub fn score_key(&self) -> String {
        self.facets.canonical_key()
    }
}

/// Explodes one event into a candidate per facet combination.
///
/// Each configured granularity is crossed with, for every dimension, each
/// supplied value plus the unfiltered branch. Dimensions are visited in key
/// order, so the output order is deterministic.
#[must_use]
pub fn explode(
    event: &InputScoreUpdate,
    position: usize,
    granularities: &[TimeGranularity],
) -> Vec<ScoreUpdate> {
    let mut combinations: Vec<FacetSet> = granularities
        .iter()
        .map(|g| FacetSet::new().with_time(*g, event.date))
        .collect();

    for (key, values) in &event.input_facets {
        let mut next = Vec::with_capacity(combinations.len() * (values.len() + 1));
        for set in combinations {
            for value in values {
                next.push(set.clone().with_generic(key.clone(), value.clone()));
            }
            next.push(set);
        }
        combinations = next;
    }

    combinations
        .into_iter()
        .map(|facets| ScoreUpdate {
            user_id: event.user_id.clone(),
            score: event.score,
            facets,
            sources: BTreeSet::from([position]),
        })
        .collect()
}

/// Merges candidates that target the same `(user, combination)`.
///
/// Deltas are summed and source positions unioned. The first occurrence of
/// each group fixes its position in the output. A candidate whose delta
/// would overflow its group's sum starts a new unit for the same row instead,
/// so no delta is ever lost.
#[must_use]
pub fn compress(updates: impl IntoIterator<Item = ScoreUpdate>) -> Vec<ScoreUpdate> {
    let mut merged: Vec<ScoreUpdate> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();

    for update in updates {
        let group = (update.user_id.clone(), update.score_key());
        if let Some(&slot) = index.get(&group) {
            let target = &mut merged[slot];
            if let Some(sum) = target.score.checked_add(update.score) {
                target.score = sum;
                target.sources.extend(update.sources);
                continue;
            }
        }
        index.insert(group, merged.len());
        merged.push(update);
    }

    merged
}

/// Deferred writes, ready to run against a leaderboard store.
///
/// Nothing touches the store until [`execute`](Self::execute) is awaited.
#[derive(Debug, Clone, Default)]
pub struct UpdateSchedule {
    units: Vec<ScoreUpdate>,
}

/// Wraps updates into a schedule of deferred writes in shuffled order.
#[must_use]
pub fn schedule(mut updates: Vec<ScoreUpdate>) -> UpdateSchedule {
    updates.shuffle(&mut rand::thread_rng());
    UpdateSchedule { units: updates }
}

impl UpdateSchedule {
    /// Returns the number of scheduled units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Returns true if nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Returns the scheduled units in execution order.
    #[must_use]
    pub fn units(&self) -> &[ScoreUpdate] {
        &self.units
    }

    /// Runs every unit with at most `concurrency` in flight.
    pub async fn execute<S: TableBackend + ?Sized>(
        self,
        store: &LeaderboardStore<S>,
        concurrency: usize,
    ) -> PipelineOutcome {
        let metrics = PodiumMetrics::new();
        let results: Vec<(ScoreUpdate, Result<LeaderboardRecord>)> =
            stream::iter(self.units.into_iter().map(|unit| async move {
                let result = store
                    .increment_key(&unit.user_id, &unit.score_key(), unit.score)
                    .await;
                (unit, result)
            }))
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut outcome = PipelineOutcome::default();
        for (unit, result) in results {
            match result {
                Ok(record) => {
                    metrics.record_increment("committed");
                    outcome.committed.push(record);
                }
                Err(error) => {
                    metrics.record_increment("failed");
                    tracing::warn!(
                        user_id = %unit.user_id,
                        score_key = %unit.score_key(),
                        error = %error,
                        "score update failed"
                    );
                    outcome.failed.push(FailedUpdate { update: unit, error });
                }
            }
        }
        outcome
    }
}

/// A unit of work that did not commit.
#[derive(Debug)]
pub struct FailedUpdate {
    /// The update that failed.
    pub update: ScoreUpdate,
    /// Why it failed.
    pub error: Error,
}

/// An input event rejected before the pipeline.
#[derive(Debug)]
pub struct RejectedInput {
    /// Batch position of the event.
    pub position: usize,
    /// Why it was rejected.
    pub error: Error,
}

/// Result of running the pipeline over a batch.
#[derive(Debug, Default)]
pub struct PipelineOutcome {
    /// Records as written by committed units.
    pub committed: Vec<LeaderboardRecord>,
    /// Units that failed.
    pub failed: Vec<FailedUpdate>,
    /// Events rejected by validation.
    pub rejected: Vec<RejectedInput>,
}

impl PipelineOutcome {
    /// Returns true if every unit committed.
    #[must_use]
    pub fn all_committed(&self) -> bool {
        self.failed.is_empty()
    }

    /// Returns the batch positions of events with at least one failed unit.
    #[must_use]
    pub fn failed_sources(&self) -> BTreeSet<usize> {
        self.failed
            .iter()
            .flat_map(|f| f.update.sources.iter().copied())
            .collect()
    }
}

/// Runs the whole pipeline for finite batches of events.
pub struct ScorePipeline<S: TableBackend + ?Sized> {
    leaderboard: LeaderboardStore<S>,
    config: PipelineConfig,
}

impl<S: TableBackend + ?Sized> std::fmt::Debug for ScorePipeline<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScorePipeline")
            .field("leaderboard", &self.leaderboard)
            .field("config", &self.config)
            .finish()
    }
}

impl<S: TableBackend + ?Sized> ScorePipeline<S> {
    /// Creates a pipeline writing into the given leaderboard.
    #[must_use]
    pub const fn new(leaderboard: LeaderboardStore<S>, config: PipelineConfig) -> Self {
        Self {
            leaderboard,
            config,
        }
    }

    /// Returns the leaderboard this pipeline writes to.
    #[must_use]
    pub const fn leaderboard(&self) -> &LeaderboardStore<S> {
        &self.leaderboard
    }

    /// Returns the pipeline settings.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validates, explodes, compresses and schedules a batch without writing.
    ///
    /// Invalid events are returned as rejections with their batch position.
    #[must_use]
    pub fn plan(&self, events: &[InputScoreUpdate]) -> (UpdateSchedule, Vec<RejectedInput>) {
        let mut rejected = Vec::new();
        let mut exploded = Vec::new();

        for (position, event) in events.iter().enumerate() {
            match event.validate(&self.config) {
                Ok(()) => exploded.extend(explode(event, position, &self.config.granularities)),
                Err(error) => rejected.push(RejectedInput { position, error }),
            }
        }

        let candidates = exploded.len();
        let compressed = compress(exploded);
        tracing::debug!(candidates, compressed = compressed.len(), "batch compressed");

        (schedule(compressed), rejected)
    }

    /// Runs the pipeline to completion for a batch of events.
    pub async fn update_scores(&self, events: &[InputScoreUpdate]) -> PipelineOutcome {
        let batch_id = ulid::Ulid::new().to_string();
        let span = pipeline_span(&batch_id, events.len());

        async {
            let _timer = time_pipeline_run();
            let (schedule, rejected) = self.plan(events);
            if !rejected.is_empty() {
                PodiumMetrics::new().record_malformed(rejected.len() as u64);
                for r in &rejected {
                    tracing::warn!(position = r.position, error = %r.error, "rejected input event");
                }
            }

            let units = schedule.len();
            let mut outcome = schedule
                .execute(&self.leaderboard, self.config.concurrency)
                .await;
            outcome.rejected = rejected;

            tracing::info!(
                units,
                committed = outcome.committed.len(),
                failed = outcome.failed.len(),
                rejected = outcome.rejected.len(),
                "pipeline finished"
            );
            outcome
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 9, 14, 10, 30, 0).unwrap()
    }

    fn six() -> Vec<TimeGranularity> {
        TimeGranularity::ALL[..6].to_vec()
    }

    #[test]
    fn explode_counts_match_cross_product() {
        let event = InputScoreUpdate::new("u1", 10, at())
            .with_facet("organisation", ["acme"])
            .with_facet("location", ["melbourne"])
            .with_facet("tag", ["aws", "ec2"]);

        let updates = explode(&event, 0, &six());
        assert_eq!(updates.len(), 6 * 2 * 2 * 3);
        assert_eq!(event.explosion_size(6), Some(72));
        assert!(updates.iter().all(|u| u.score == 10 && u.sources == BTreeSet::from([0])));
    }

    #[test]
    fn explode_without_dimensions_is_one_per_granularity() {
        let event = InputScoreUpdate::new("u1", 1, at());
        let updates = explode(&event, 3, &[TimeGranularity::Day, TimeGranularity::AllTime]);
        let keys: Vec<_> = updates.iter().map(ScoreUpdate::score_key).collect();
        assert_eq!(keys, ["_(day-2017/09/14)", "_(allTime-AT)"]);
    }

    #[test]
    fn explode_includes_unfiltered_branch() {
        let event = InputScoreUpdate::new("u1", 1, at()).with_facet("tag", ["aws"]);
        let keys: BTreeSet<_> = explode(&event, 0, &[TimeGranularity::Year])
            .iter()
            .map(ScoreUpdate::score_key)
            .collect();
        assert_eq!(
            keys,
            BTreeSet::from(["_(year-2017)".to_string(), "_(tag-aws)_(year-2017)".to_string()])
        );
    }

    #[test]
    fn compress_sums_and_unions_sources() {
        let events: Vec<_> = (0..4)
            .map(|i| InputScoreUpdate::new("u1", i64::from(i) + 1, at()))
            .collect();
        let exploded = events
            .iter()
            .enumerate()
            .flat_map(|(pos, e)| explode(e, pos, &[TimeGranularity::Day]));

        let compressed = compress(exploded);
        assert_eq!(compressed.len(), 1);
        assert_eq!(compressed[0].score, 1 + 2 + 3 + 4);
        assert_eq!(compressed[0].sources, BTreeSet::from([0, 1, 2, 3]));
    }

    #[test]
    fn compress_keeps_users_apart_and_first_seen_order() {
        let a = InputScoreUpdate::new("b-user", 1, at());
        let b = InputScoreUpdate::new("a-user", 2, at());
        let exploded: Vec<_> = explode(&a, 0, &[TimeGranularity::Day])
            .into_iter()
            .chain(explode(&b, 1, &[TimeGranularity::Day]))
            .chain(explode(&a, 2, &[TimeGranularity::Day]))
            .collect();

        let compressed = compress(exploded);
        assert_eq!(compressed.len(), 2);
        assert_eq!(compressed[0].user_id, "b-user");
        assert_eq!(compressed[0].score, 2);
        assert_eq!(compressed[1].user_id, "a-user");
    }

    #[test]
    fn compress_never_overflows_a_sum() {
        let event = |score, position| ScoreUpdate {
            user_id: "u1".into(),
            score,
            facets: FacetSet::new().with_time(TimeGranularity::AllTime, at()),
            sources: BTreeSet::from([position]),
        };
        let compressed = compress([event(i64::MAX, 0), event(1, 1), event(-2, 2)]);

        let scores: Vec<_> = compressed.iter().map(|u| u.score).collect();
        assert_eq!(scores, [i64::MAX, -1]);
        assert_eq!(compressed[0].sources, BTreeSet::from([0]));
        assert_eq!(compressed[1].sources, BTreeSet::from([1, 2]));
    }

    #[test]
    fn schedule_keeps_every_unit() {
        let event = InputScoreUpdate::new("u1", 1, at()).with_facet("tag", ["a", "b", "c"]);
        let updates = explode(&event, 0, &TimeGranularity::ALL);
        let expected: BTreeSet<_> = updates.iter().map(ScoreUpdate::score_key).collect();

        let scheduled = schedule(updates);
        let actual: BTreeSet<_> = scheduled.units().iter().map(ScoreUpdate::score_key).collect();
        assert_eq!(scheduled.len(), 32);
        assert_eq!(actual, expected);
    }

    #[test]
    fn validation_rejects_malformed_events() {
        let config = PipelineConfig::default();

        let blank = InputScoreUpdate::new("  ", 1, at());
        assert!(blank.validate(&config).unwrap_err().is_malformed());

        let empty_key = InputScoreUpdate::new("u1", 1, at()).with_facet("", ["x"]);
        assert!(empty_key.validate(&config).is_err());

        let collides = InputScoreUpdate::new("u1", 1, at()).with_facet("day", ["x"]);
        assert!(collides.validate(&config).is_err());

        let empty_value = InputScoreUpdate::new("u1", 1, at()).with_facet("tag", [""]);
        assert!(empty_value.validate(&config).is_err());

        let ok = InputScoreUpdate::new("u1", 1, at()).with_facet("tag", ["x"]);
        assert!(ok.validate(&config).is_ok());
    }

    #[test]
    fn validation_rejects_key_delimiters() {
        let config = PipelineConfig::default();

        let forged_value = InputScoreUpdate::new("u1", 1, at())
            .with_facet("location", ["melbourne)_(tags-aws"]);
        let err = forged_value.validate(&config).unwrap_err();
        assert!(err.is_malformed());
        assert!(err.to_string().contains("delimiter"));

        let dashed_key = InputScoreUpdate::new("u1", 1, at()).with_facet("home-town", ["x"]);
        assert!(dashed_key.validate(&config).unwrap_err().is_malformed());

        let dashed_value = InputScoreUpdate::new("u1", 1, at()).with_facet("tag", ["ec2-spot"]);
        assert!(dashed_value.validate(&config).is_ok());
    }

    #[test]
    fn validation_enforces_explosion_ceiling() {
        let config = PipelineConfig {
            max_updates_per_event: 16,
            ..PipelineConfig::default()
        };
        // 8 granularities x 2 = 16: allowed
        let ok = InputScoreUpdate::new("u1", 1, at()).with_facet("tag", ["a"]);
        assert!(ok.validate(&config).is_ok());
        // 8 x 3 = 24: rejected
        let wide = InputScoreUpdate::new("u1", 1, at()).with_facet("tag", ["a", "b"]);
        assert!(wide.validate(&config).is_err());
    }

    #[test]
    fn parse_input_decodes_wire_format() {
        let payload = r#"{
            "userId": "u1",
            "score": 50,
            "date": 1505347200000,
            "inputFacets": {"location": ["melbourne"], "tag": ["aws", "ec2"]}
        }"#;
        let event = parse_input(payload, &PipelineConfig::default()).expect("valid");
        assert_eq!(event.user_id, "u1");
        assert_eq!(event.date.timestamp_millis(), 1_505_347_200_000);
        assert_eq!(event.input_facets["tag"], ["aws", "ec2"]);

        let err = parse_input("{not json", &PipelineConfig::default()).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn missing_input_facets_default_to_empty() {
        let event = parse_input(
            r#"{"userId":"u1","score":1,"date":0}"#,
            &PipelineConfig::default(),
        )
        .unwrap();
        assert!(event.input_facets.is_empty());
    }
}
