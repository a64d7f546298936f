use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{Level, instrument};

use crate::{
    Error,
    api::OperationOutcome,
    config::NodePoolConfig,
    drain::{
        DEFAULT_DELETION_POLL_INTERVAL, DEFAULT_EVICTION_RETRY_INTERVAL, DrainOptions,
        EvictionObserver,
    },
    nodes::NodePoolApi,
    readiness::{DEFAULT_POLL_INTERVAL, wait_for_ready},
    teardown::teardown,
};

/// Polling cadence shared by create and delete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Intervals {
    pub readiness_poll: Duration,
    pub eviction_retry: Duration,
    pub deletion_poll: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            readiness_poll: DEFAULT_POLL_INTERVAL,
            eviction_retry: DEFAULT_EVICTION_RETRY_INTERVAL,
            deletion_poll: DEFAULT_DELETION_POLL_INTERVAL,
        }
    }
}

/// Create path: succeed once the pool has enough ready nodes.
#[instrument(level = Level::DEBUG, skip_all, fields(pool = %config.node_pool_name))]
pub async fn create<A: NodePoolApi + ?Sized>(
    api: &A,
    config: &NodePoolConfig,
    intervals: &Intervals,
    cancel: &CancellationToken,
) -> OperationOutcome {
    let requirement = match config.readiness_requirement() {
        Ok(requirement) => requirement,
        Err(e) => return OperationOutcome::failure(e),
    };
    let target = config.target();

    match wait_for_ready(api, &target, &requirement, intervals.readiness_poll, cancel).await {
        Ok(report) => {
            tracing::debug!(
                "found required number of ready nodes in node pool {} ({}/{})...resource created",
                target.name,
                report.ready,
                report.total
            );
            OperationOutcome::Success
        }
        Err(e) => OperationOutcome::failure(e),
    }
}

/// Delete path: cordon and drain every node currently in the pool.
#[instrument(level = Level::DEBUG, skip_all, fields(pool = %config.node_pool_name))]
pub async fn delete<A: NodePoolApi + ?Sized>(
    api: &A,
    config: &NodePoolConfig,
    intervals: &Intervals,
    observer: &dyn EvictionObserver,
    cancel: &CancellationToken,
) -> OperationOutcome {
    let plan = match config.drain_plan() {
        Ok(plan) => plan,
        Err(e) => return OperationOutcome::failure(e),
    };
    let target = config.target();

    tracing::debug!("draining node pool {}", target.name);

    let nodes = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return OperationOutcome::failure(Error::Cancelled { pool: target.name.clone() });
        }
        nodes = api.list_nodes(&target.selector) => nodes,
    };
    let nodes = match nodes {
        Ok(nodes) => nodes,
        Err(source) => {
            return OperationOutcome::failure(Error::Access {
                pool: target.name.clone(),
                selector: target.selector.to_string(),
                source,
            });
        }
    };

    if nodes.is_empty() {
        tracing::info!("no nodes found in node pool {}, nothing to drain", target.name);
        return OperationOutcome::Success;
    }

    let options = DrainOptions {
        timeout: plan.drain_timeout,
        eviction_retry_interval: intervals.eviction_retry,
        deletion_poll_interval: intervals.deletion_poll,
    };

    teardown(api, &target.name, &nodes, &plan, &options, observer, cancel).await
}
