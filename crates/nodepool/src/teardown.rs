use tokio_util::sync::CancellationToken;
use tracing::{Level, instrument};

use crate::{
    Error,
    api::{DrainPlan, NodeSnapshot, OperationOutcome, TeardownPhase, TeardownProgress},
    cordon::cordon,
    drain::{DrainError, DrainOptions, EvictionObserver, drain},
    nodes::NodePoolApi,
};

/// Cordon every node, then drain them one at a time with a pause in between.
///
/// All cordons complete before the first drain starts, so evicted pods never land on
/// a node that is about to be drained. The first failure ends the teardown; nodes
/// cordoned so far stay cordoned.
#[instrument(level = Level::DEBUG, skip_all, fields(pool = %pool, nodes = nodes.len()))]
pub async fn teardown<A: NodePoolApi + ?Sized>(
    api: &A,
    pool: &str,
    nodes: &[NodeSnapshot],
    plan: &DrainPlan,
    options: &DrainOptions,
    observer: &dyn EvictionObserver,
    cancel: &CancellationToken,
) -> OperationOutcome {
    let mut cordoned = Vec::with_capacity(nodes.len());
    let mut drained = Vec::with_capacity(nodes.len());

    let stopped = |phase, node: &str, cordoned: &[String], drained: &[String], reason| {
        let progress = TeardownProgress {
            phase,
            node: node.to_string(),
            cordoned: cordoned.to_vec(),
            drained: drained.to_vec(),
        };
        tracing::error!("teardown of node pool {pool} {progress}");
        OperationOutcome::Failure {
            reason,
            progress: Some(progress),
        }
    };

    for node in nodes {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled { pool: pool.to_string() }),
            result = cordon(api, &node.name) => result,
        };
        if let Err(reason) = result {
            return stopped(TeardownPhase::Cordon, &node.name, &cordoned, &drained, reason);
        }
        cordoned.push(node.name.clone());
    }
    tracing::info!("cordoned {} nodes in node pool {pool}", cordoned.len());

    let options = DrainOptions {
        timeout: plan.drain_timeout,
        ..*options
    };

    for (i, node) in nodes.iter().enumerate() {
        match drain(api, &node.name, &options, observer, cancel).await {
            Ok(report) => tracing::info!(
                "drained node {} ({} pods evicted)",
                node.name,
                report.evicted.len()
            ),
            Err(DrainError::Cancelled { .. }) => {
                let reason = Error::Cancelled {
                    pool: pool.to_string(),
                };
                return stopped(TeardownPhase::Drain, &node.name, &cordoned, &drained, reason);
            }
            Err(e) => {
                return stopped(TeardownPhase::Drain, &node.name, &cordoned, &drained, e.into());
            }
        }
        drained.push(node.name.clone());

        let Some(next) = nodes.get(i + 1) else {
            break;
        };
        tracing::debug!("sleeping after draining node {}", node.name);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let reason = Error::Cancelled { pool: pool.to_string() };
                return stopped(TeardownPhase::Drain, &next.name, &cordoned, &drained, reason);
            }
            _ = tokio::time::sleep(plan.inter_node_pause) => {}
        }
    }

    OperationOutcome::Success
}
