//! Property-based tests for pipeline invariants.
//!
//! These tests use proptest to verify invariants hold across
//! randomly generated score events.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use podium_core::{MemoryTableBackend, TimeGranularity};
use podium_flow::config::{LeaderboardConfig, PipelineConfig};
use podium_flow::leaderboard::LeaderboardStore;
use podium_flow::pipeline::{compress, explode, InputScoreUpdate, ScorePipeline};

const GRANULARITIES: [TimeGranularity; 3] = [
    TimeGranularity::Day,
    TimeGranularity::Week,
    TimeGranularity::AllTime,
];

fn arb_values() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(
        prop::sample::select(vec!["a", "b", "c"]).prop_map(String::from),
        0..3,
    )
}

/// Generates an event from a small user, date and dimension space so that
/// batches collide often.
fn arb_event() -> impl Strategy<Value = InputScoreUpdate> {
    (
        prop::sample::select(vec!["u1", "u2", "u3"]),
        -100i64..100,
        0i64..(3 * 86_400_000),
        arb_values(),
        arb_values(),
    )
        .prop_map(|(user, score, offset, locations, tags)| {
            let base = Utc.with_ymd_and_hms(2021, 3, 14, 0, 0, 0).single().unwrap();
            let mut event =
                InputScoreUpdate::new(user, score, base + chrono::Duration::milliseconds(offset));
            if !locations.is_empty() {
                event = event.with_facet("location", locations);
            }
            if !tags.is_empty() {
                event = event.with_facet("tags", tags);
            }
            event
        })
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime")
}

proptest! {
    #[test]
    fn explode_matches_explosion_size(event in arb_event()) {
        let updates = explode(&event, 0, &GRANULARITIES);
        prop_assert_eq!(Some(updates.len()), event.explosion_size(GRANULARITIES.len()));
    }

    #[test]
    fn compress_preserves_totals_and_dedups(events in prop::collection::vec(arb_event(), 1..8)) {
        let exploded: Vec<_> = events
            .iter()
            .enumerate()
            .flat_map(|(i, e)| explode(e, i, &GRANULARITIES))
            .collect();

        let mut expected: BTreeMap<(String, String), i64> = BTreeMap::new();
        for u in &exploded {
            *expected.entry((u.user_id.clone(), u.score_key())).or_default() += u.score;
        }

        let compressed = compress(exploded);
        let mut seen = HashSet::new();
        for u in &compressed {
            let group = (u.user_id.clone(), u.score_key());
            prop_assert!(seen.insert(group.clone()), "duplicate group {:?}", group);
            prop_assert_eq!(expected.get(&group).copied(), Some(u.score));
            prop_assert!(u.sources.iter().all(|&s| s < events.len()));
        }
        prop_assert_eq!(compressed.len(), expected.len());
    }

    #[test]
    fn stored_scores_equal_summed_deltas(events in prop::collection::vec(arb_event(), 1..6)) {
        let config = PipelineConfig {
            granularities: GRANULARITIES.to_vec(),
            ..PipelineConfig::default()
        };
        let leaderboard = LeaderboardStore::new(
            Arc::new(MemoryTableBackend::new()),
            &LeaderboardConfig::default(),
        );
        let pipeline = ScorePipeline::new(leaderboard, config);

        let mut expected: BTreeMap<(String, String), i64> = BTreeMap::new();
        for (i, e) in events.iter().enumerate() {
            for u in explode(e, i, &GRANULARITIES) {
                *expected.entry((u.user_id.clone(), u.score_key())).or_default() += u.score;
            }
        }

        let rt = runtime();
        let outcome = rt.block_on(pipeline.update_scores(&events));
        prop_assert!(outcome.all_committed());

        for ((user, key), total) in &expected {
            let record = rt
                .block_on(pipeline.leaderboard().get_user_score(user, key))
                .unwrap()
                .unwrap();
            prop_assert_eq!(record.score, *total);
        }
    }
}
