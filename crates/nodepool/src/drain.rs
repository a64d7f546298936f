//! Evicts workloads from a single node, similar to `kubectl drain` without the cordon.
//!
//! Pods are removed through the Eviction API so PodDisruptionBudgets are respected and
//! each pod gets its own termination grace period. By default we skip:
//! * DaemonSet pods - the DaemonSet controller ignores cordons and would recreate them.
//! * Mirror pods - static pods owned by the kubelet, which the API cannot delete.
//!
//! Pods using emptyDir storage and pods without a controller are evicted; their local
//! data is lost.

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::future::try_join_all;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Level, instrument};

use crate::{
    ApiError,
    api::{EvictionEvent, Eviction, PodSnapshot},
    nodes::NodePoolApi,
};

/// Wait between attempts when an eviction is refused by a disruption budget.
/// `kubectl drain` waits 5 seconds as well.
pub const DEFAULT_EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Wait between checks for evicted pods to disappear.
pub const DEFAULT_DELETION_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("Could not list pods on node {node}: {source}")]
    ListPods { node: String, source: ApiError },
    #[error("Could not evict pod {pod} from node {node}: {source}")]
    Evict {
        node: String,
        pod: String,
        source: ApiError,
    },
    #[error("Timed out after {timeout:?} draining node {node}, pods remaining: [{}]", pending.join(", "))]
    Timeout {
        node: String,
        timeout: Duration,
        pending: Vec<String>,
    },
    #[error("Drain of node {node} was cancelled")]
    Cancelled { node: String },
}

impl DrainError {
    pub fn node(&self) -> &str {
        match self {
            Self::ListPods { node, .. }
            | Self::Evict { node, .. }
            | Self::Timeout { node, .. }
            | Self::Cancelled { node } => node,
        }
    }
}

/// Receives one event per pod eviction. Purely advisory.
pub trait EvictionObserver: Send + Sync {
    fn on_eviction(&self, event: &EvictionEvent);
}

impl<F> EvictionObserver for F
where
    F: Fn(&EvictionEvent) + Send + Sync,
{
    fn on_eviction(&self, event: &EvictionEvent) {
        self(event)
    }
}

/// Logs every eviction event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl EvictionObserver for TracingObserver {
    fn on_eviction(&self, event: &EvictionEvent) {
        match &event.result {
            Ok(()) => tracing::debug!("evicted pod {} from node {}", event.pod, event.node),
            Err(e) => tracing::warn!(
                "failed to evict pod {} from node {}: {e}",
                event.pod,
                event.node
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainOptions {
    /// Ceiling for the whole node; zero waits indefinitely.
    pub timeout: Duration,
    pub eviction_retry_interval: Duration,
    pub deletion_poll_interval: Duration,
}

impl DrainOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            eviction_retry_interval: DEFAULT_EVICTION_RETRY_INTERVAL,
            deletion_poll_interval: DEFAULT_DELETION_POLL_INTERVAL,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub evicted: Vec<String>,
    pub skipped: Vec<String>,
}

/// Split the pods on a node into those to evict and those left running.
pub fn partition_pods(pods: Vec<PodSnapshot>) -> (Vec<PodSnapshot>, Vec<PodSnapshot>) {
    pods.into_iter().partition(|pod| !pod.daemon_set && !pod.mirror)
}

enum Interrupt {
    Deadline,
    Cancelled,
}

/// Evict every drainable pod from `node` and wait for them to terminate.
#[instrument(level = Level::DEBUG, skip(api, observer, cancel))]
pub async fn drain<A: NodePoolApi + ?Sized>(
    api: &A,
    node: &str,
    options: &DrainOptions,
    observer: &dyn EvictionObserver,
    cancel: &CancellationToken,
) -> Result<DrainReport, DrainError> {
    tracing::debug!("draining node {node}");

    let deadline = (!options.timeout.is_zero()).then(|| Instant::now() + options.timeout);
    let pending = Pending::default();

    let interrupt = {
        let work = drain_pods(api, node, options, observer, &pending);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Interrupt::Cancelled,
            _ = expire(deadline) => Interrupt::Deadline,
            result = work => return result,
        }
    };

    match interrupt {
        Interrupt::Cancelled => Err(DrainError::Cancelled {
            node: node.to_string(),
        }),
        Interrupt::Deadline => {
            let pending = pending.take();
            for pod in &pending {
                observer.on_eviction(&EvictionEvent {
                    node: node.to_string(),
                    pod: pod.clone(),
                    result: Err(format!("not deleted within {:?}", options.timeout)),
                });
            }
            Err(DrainError::Timeout {
                node: node.to_string(),
                timeout: options.timeout,
                pending,
            })
        }
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Keys of pods whose deletion has not been confirmed yet, in listing order.
#[derive(Default)]
struct Pending(Mutex<Vec<String>>);

impl Pending {
    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, keys: Vec<String>) {
        *self.lock() = keys;
    }

    fn remove(&self, key: &str) {
        self.lock().retain(|p| p != key);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lock())
    }
}

async fn drain_pods<A: NodePoolApi + ?Sized>(
    api: &A,
    node: &str,
    options: &DrainOptions,
    observer: &dyn EvictionObserver,
    pending: &Pending,
) -> Result<DrainReport, DrainError> {
    let pods = api
        .list_pods_on_node(node)
        .await
        .map_err(|source| DrainError::ListPods {
            node: node.to_string(),
            source,
        })?;

    let (targets, skipped) = partition_pods(pods);
    for pod in &skipped {
        tracing::debug!(
            "ignoring DaemonSet-managed or mirror pod {} on node {node}",
            pod.key()
        );
    }
    pending.set(targets.iter().map(PodSnapshot::key).collect());

    let evicted = try_join_all(targets.iter().map(|pod| async move {
        if evict_with_retry(api, node, pod, options, observer).await? == Eviction::Accepted {
            wait_for_deletion(api, pod, options.deletion_poll_interval).await;
        }

        let key = pod.key();
        pending.remove(&key);
        observer.on_eviction(&EvictionEvent {
            node: node.to_string(),
            pod: key.clone(),
            result: Ok(()),
        });
        Ok::<_, DrainError>(key)
    }))
    .await?;

    Ok(DrainReport {
        evicted,
        skipped: skipped.iter().map(PodSnapshot::key).collect(),
    })
}

/// Returns [`Eviction::Accepted`] or [`Eviction::AlreadyGone`].
async fn evict_with_retry<A: NodePoolApi + ?Sized>(
    api: &A,
    node: &str,
    pod: &PodSnapshot,
    options: &DrainOptions,
    observer: &dyn EvictionObserver,
) -> Result<Eviction, DrainError> {
    if pod.local_storage {
        tracing::debug!("evicting pod {} with local storage on node {node}", pod.key());
    }

    loop {
        match api.evict_pod(pod).await {
            Ok(Eviction::Blocked(reason)) => {
                tracing::warn!(
                    "eviction of pod {} refused: {reason}. Retrying in {:?}",
                    pod.key(),
                    options.eviction_retry_interval
                );
                tokio::time::sleep(options.eviction_retry_interval).await;
            }
            Ok(eviction) => return Ok(eviction),
            Err(source) => {
                observer.on_eviction(&EvictionEvent {
                    node: node.to_string(),
                    pod: pod.key(),
                    result: Err(source.to_string()),
                });
                return Err(DrainError::Evict {
                    node: node.to_string(),
                    pod: pod.key(),
                    source,
                });
            }
        }
    }
}

async fn wait_for_deletion<A: NodePoolApi + ?Sized>(
    api: &A,
    pod: &PodSnapshot,
    poll_interval: Duration,
) {
    loop {
        match api.pod_is_gone(pod).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => tracing::warn!(
                "could not determine if pod {} has been deleted: {e}",
                pod.key()
            ),
        }
        tokio::time::sleep(poll_interval).await;
    }
}
