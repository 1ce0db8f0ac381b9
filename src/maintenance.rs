//! Expired-poll sweep

use crate::Result;
use crate::config::RetryConfig;
use crate::store::{PollStore, with_retry};
use crate::types::{PollId, Timestamp};

/// Delete every poll whose `closes_at` is before `now`, together with its
/// questions, options, allow-list, ballots, votes and cached aggregates.
/// Polls without a close time are never pruned.
pub async fn prune_expired_polls(
    store: &dyn PollStore,
    retry: &RetryConfig,
    now: Timestamp,
) -> Result<Vec<PollId>> {
    let removed = with_retry(retry, || store.delete_polls_closed_before(now)).await?;

    if removed.is_empty() {
        tracing::debug!("no expired polls to prune");
    } else {
        tracing::info!(removed = removed.len(), "pruned expired polls");
    }
    Ok(removed)
}
