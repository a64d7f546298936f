use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Level, instrument};

use crate::{
    Error, Result,
    api::{NodePoolTarget, ReadinessRequirement},
    nodes::{NodePoolApi, count_ready_nodes},
};

/// Time between readiness polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Ready nodes observed when the requirement was satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadyReport {
    pub ready: u32,
    pub total: u32,
}

/// Poll the pool until at least `min_ready_nodes` nodes are ready.
///
/// The first poll happens immediately. A failed listing ends the wait at once rather
/// than being retried, so a bad selector fails fast. The last poll happens no later
/// than the deadline.
#[instrument(level = Level::DEBUG, skip(api, cancel), fields(pool = %target.name))]
pub async fn wait_for_ready<A: NodePoolApi + ?Sized>(
    api: &A,
    target: &NodePoolTarget,
    requirement: &ReadinessRequirement,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<ReadyReport> {
    let deadline = Instant::now() + requirement.timeout;
    let cancelled = || Error::Cancelled {
        pool: target.name.clone(),
    };

    tracing::debug!(
        "waiting for {} nodes to be ready in node pool {}",
        requirement.min_ready_nodes,
        target.name
    );

    loop {
        let nodes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            nodes = api.list_nodes(&target.selector) => nodes.map_err(|source| Error::Access {
                pool: target.name.clone(),
                selector: target.selector.to_string(),
                source,
            })?,
        };

        let ready = count_ready_nodes(&nodes);
        if ready >= requirement.min_ready_nodes {
            tracing::info!(
                "found {ready} ready nodes in node pool {}, required {}",
                target.name,
                requirement.min_ready_nodes
            );
            return Ok(ReadyReport {
                ready,
                total: nodes.len() as u32,
            });
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::ReadinessTimeout {
                pool: target.name.clone(),
                required: requirement.min_ready_nodes,
                observed: ready,
                timeout: requirement.timeout,
            });
        }

        tracing::debug!(
            "found {ready} ready nodes in node pool {}...waiting",
            target.name
        );

        let wake = deadline.min(now + poll_interval);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}
