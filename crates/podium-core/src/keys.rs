//! Score block keys for the leaderboard secondary index.
//!
//! Scores are bucketed by `floor(ln(score))` so that a top-N read can walk a
//! small number of index partitions from the highest block downwards instead of
//! scanning a whole leaderboard.

/// Highest score a top-N read can reach by default.
///
/// Records above this are stored but never returned by a top-N scan.
pub const DEFAULT_MAX_RECOGNIZABLE_SCORE: i64 = 10_000_000;

/// Returns the logarithmic block of a score.
///
/// Scores `<= 0` fall into block 0 along with scores in `[1, e)`.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn score_block(score: i64) -> i64 {
    if score <= 0 {
        return 0;
    }
    (score as f64).ln().floor() as i64
}

/// Returns the secondary index key for a record: `score_key + "_" + block`.
#[must_use]
pub fn score_block_key(score_key: &str, score: i64) -> String {
    block_index_key(score_key, score_block(score))
}

/// Returns the secondary index key for an explicit block.
#[must_use]
pub fn block_index_key(score_key: &str, block: i64) -> String {
    format!("{score_key}_{block}")
}
