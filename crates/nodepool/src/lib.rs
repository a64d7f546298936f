/// Node pool data model
pub mod api;

/// Pool configuration and cluster connection
pub mod config;

/// Cluster node access
pub mod nodes;

/// Create path: wait for ready nodes
pub mod readiness;

/// Mark nodes unschedulable
pub mod cordon;

/// Evict workloads from a node
pub mod drain;

/// Delete path: cordon all, then drain one by one
pub mod teardown;

/// Create/delete entry points
pub mod lifecycle;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use thiserror::Error;

use crate::drain::DrainError;

/// Error returned by a [`nodes::NodePoolApi`] implementation.
pub type ApiError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),
    #[error("Serde error: {0}")]
    SerdeYaml(#[from] serde_yaml_ng::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid node pool configuration: {0}")]
    Validation(#[from] garde::Report),
    #[error("Invalid duration {value:?}: {reason}")]
    InvalidDuration { value: String, reason: String },
    #[error("Invalid kube host {host:?}: {reason}")]
    InvalidHost { host: String, reason: String },
    #[error("Could not list nodes in node pool {pool} ({selector}): {source}")]
    Access {
        pool: String,
        selector: String,
        source: ApiError,
    },
    #[error(
        "Could not find {required} ready nodes in node pool {pool} within {timeout:?}, last observed {observed}"
    )]
    ReadinessTimeout {
        pool: String,
        required: u32,
        observed: u32,
        timeout: Duration,
    },
    #[error("Could not cordon node {node}: {source}")]
    Cordon { node: String, source: ApiError },
    #[error(transparent)]
    Drain(#[from] DrainError),
    #[error("Operation on node pool {pool} was cancelled")]
    Cancelled { pool: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
