//! Chunked batch reads and writes.
//!
//! Requests are split into backend-sized chunks. A chunk that comes back with
//! an unprocessed subset is retried with only that subset, after a backoff.
//! Throttling of a whole chunk is retried the same way.

use podium_core::table::{MAX_BATCH_GET, MAX_BATCH_PUT};
use podium_core::{Item, ItemKey, TableBackend};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Reads every key, in chunks of at most [`MAX_BATCH_GET`].
///
/// Missing keys are absent from the result. Result order is unspecified.
///
/// # Errors
///
/// Returns [`Error::RetriesExhausted`] if the policy runs out before every key
/// is processed, or the first non-throttling backend error.
pub async fn get_all<S: TableBackend + ?Sized>(
    store: &S,
    table: &str,
    keys: Vec<ItemKey>,
    policy: &RetryPolicy,
) -> Result<Vec<Item>> {
    let mut found = Vec::with_capacity(keys.len());

    for chunk in keys.chunks(MAX_BATCH_GET) {
        let mut pending = chunk.to_vec();
        let mut attempts = 0;

        while !pending.is_empty() {
            attempts += 1;
            match store.batch_get(table, pending.clone()).await {
                Ok(output) => {
                    found.extend(output.items);
                    pending = output.unprocessed;
                }
                Err(e) if e.is_throttled() => {
                    tracing::debug!(table, attempts, "batch get throttled");
                }
                Err(e) => return Err(e.into()),
            }

            if pending.is_empty() {
                break;
            }
            if !policy.allows_retry(attempts) {
                return Err(Error::RetriesExhausted {
                    operation: "batch_get".into(),
                    attempts,
                });
            }
            tracing::debug!(table, attempts, unprocessed = pending.len(), "retrying batch get");
            policy.backoff(attempts).await;
        }
    }

    Ok(found)
}

/// Writes every item unconditionally, in chunks of at most [`MAX_BATCH_PUT`].
///
/// # Errors
///
/// Returns [`Error::RetriesExhausted`] if the policy runs out before every item
/// is written, or the first non-throttling backend error.
pub async fn put_all<S: TableBackend + ?Sized>(
    store: &S,
    table: &str,
    items: Vec<Item>,
    policy: &RetryPolicy,
) -> Result<()> {
    for chunk in items.chunks(MAX_BATCH_PUT) {
        let mut pending = chunk.to_vec();
        let mut attempts = 0;

        while !pending.is_empty() {
            attempts += 1;
            match store.batch_put(table, pending.clone()).await {
                Ok(output) => pending = output.unprocessed,
                Err(e) if e.is_throttled() => {
                    tracing::debug!(table, attempts, "batch put throttled");
                }
                Err(e) => return Err(e.into()),
            }

            if pending.is_empty() {
                break;
            }
            if !policy.allows_retry(attempts) {
                return Err(Error::RetriesExhausted {
                    operation: "batch_put".into(),
                    attempts,
                });
            }
            tracing::debug!(table, attempts, unprocessed = pending.len(), "retrying batch put");
            policy.backoff(attempts).await;
        }
    }

    Ok(())
}
