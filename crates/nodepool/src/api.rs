use std::{fmt, time::Duration};

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use serde::Serialize;

use crate::Error;

/// Label key/value pair used to find the member nodes of a pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct NodeSelector {
    pub key: String,
    pub value: String,
}

impl NodeSelector {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Label selector in the `key=value` form accepted by the API server.
    pub fn to_label_selector(&self) -> String {
        format!("{}={}", self.key, self.value)
    }
}

impl fmt::Display for NodeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// The pool under management.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodePoolTarget {
    pub name: String,
    pub selector: NodeSelector,
}

/// Tri-state value of a node's `Ready` condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ReadyCondition {
    True,
    False,
    Unknown,
}

impl ReadyCondition {
    fn from_status(status: &str) -> Self {
        match status {
            "True" => Self::True,
            "False" => Self::False,
            _ => Self::Unknown,
        }
    }
}

/// Point-in-time view of a cluster node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeSnapshot {
    pub name: String,
    /// `None` when the node reports no `Ready` condition at all.
    pub ready: Option<ReadyCondition>,
}

impl NodeSnapshot {
    pub fn new(name: impl Into<String>, ready: Option<ReadyCondition>) -> Self {
        Self {
            name: name.into(),
            ready,
        }
    }

    /// Missing and non-`True` conditions are both treated as not ready.
    pub fn is_ready(&self) -> bool {
        self.ready == Some(ReadyCondition::True)
    }
}

impl From<&Node> for NodeSnapshot {
    fn from(node: &Node) -> Self {
        let ready = node
            .status
            .as_ref()
            .and_then(|status| status.conditions.as_ref())
            .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
            .map(|c| ReadyCondition::from_status(&c.status));

        Self {
            name: node.name_any(),
            ready,
        }
    }
}

/// The subset of a pod's state the drain operator cares about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodSnapshot {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    /// Controlled by a DaemonSet.
    pub daemon_set: bool,
    /// Static pod mirrored by the kubelet; cannot be deleted through the API.
    pub mirror: bool,
    /// Uses emptyDir volumes whose data is lost on eviction.
    pub local_storage: bool,
}

impl PodSnapshot {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: None,
            daemon_set: false,
            mirror: false,
            local_storage: false,
        }
    }

    /// `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

impl From<&Pod> for PodSnapshot {
    fn from(pod: &Pod) -> Self {
        let daemon_set = pod.owner_references().iter().any(|owner| {
            owner.controller == Some(true) && owner.kind == "DaemonSet"
        });
        let mirror = pod.annotations().contains_key(MIRROR_POD_ANNOTATION);
        let local_storage = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.volumes.as_ref())
            .is_some_and(|volumes| volumes.iter().any(|v| v.empty_dir.is_some()));

        Self {
            namespace: pod.namespace().unwrap_or_else(|| "default".to_string()),
            name: pod.name_any(),
            uid: pod.uid(),
            daemon_set,
            mirror,
            local_storage,
        }
    }
}

/// Result of a single eviction request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Eviction {
    /// The API server accepted the eviction.
    Accepted,
    /// The pod no longer exists.
    AlreadyGone,
    /// Refused for now, typically by a PodDisruptionBudget.
    Blocked(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadinessRequirement {
    pub min_ready_nodes: u32,
    pub timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainPlan {
    /// Per-node ceiling; zero disables the limit.
    pub drain_timeout: Duration,
    pub inter_node_pause: Duration,
}

/// One pod eviction, reported to an [`EvictionObserver`](crate::drain::EvictionObserver).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvictionEvent {
    pub node: String,
    pub pod: String,
    pub result: Result<(), String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownPhase {
    Cordon,
    Drain,
}

impl fmt::Display for TeardownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cordon => f.write_str("cordon"),
            Self::Drain => f.write_str("drain"),
        }
    }
}

/// Where a teardown stopped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TeardownProgress {
    pub phase: TeardownPhase,
    pub node: String,
    pub cordoned: Vec<String>,
    pub drained: Vec<String>,
}

impl fmt::Display for TeardownProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stopped in {} phase at node {} (cordoned: [{}], drained: [{}])",
            self.phase,
            self.node,
            self.cordoned.join(", "),
            self.drained.join(", ")
        )
    }
}

/// Final result of a create or delete pass. Never retried by this crate.
#[derive(Debug)]
pub enum OperationOutcome {
    Success,
    Failure {
        reason: Error,
        progress: Option<TeardownProgress>,
    },
}

impl OperationOutcome {
    pub fn failure(reason: impl Into<Error>) -> Self {
        Self::Failure {
            reason: reason.into(),
            progress: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::core::v1::{EmptyDirVolumeSource, NodeCondition, NodeStatus, PodSpec, Volume},
        apimachinery::pkg::apis::meta::v1::OwnerReference,
    };
    use kube::api::ObjectMeta;

    use super::*;

    fn node_with_conditions(conditions: Vec<(&str, &str)>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-a".to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(
                    conditions
                        .into_iter()
                        .map(|(type_, status)| NodeCondition {
                            type_: type_.to_string(),
                            status: status.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn ready_condition_is_read_from_condition_list() {
        let node = node_with_conditions(vec![("MemoryPressure", "False"), ("Ready", "True")]);
        let snapshot = NodeSnapshot::from(&node);
        assert_eq!(snapshot.name, "node-a");
        assert_eq!(snapshot.ready, Some(ReadyCondition::True));
        assert!(snapshot.is_ready());
    }

    #[test]
    fn missing_ready_condition_is_not_ready() {
        let snapshot = NodeSnapshot::from(&node_with_conditions(vec![("DiskPressure", "False")]));
        assert_eq!(snapshot.ready, None);
        assert!(!snapshot.is_ready());

        let snapshot = NodeSnapshot::from(&Node::default());
        assert!(!snapshot.is_ready());
    }

    #[test]
    fn unknown_and_false_are_not_ready() {
        let unknown = NodeSnapshot::from(&node_with_conditions(vec![("Ready", "Unknown")]));
        let not_ready = NodeSnapshot::from(&node_with_conditions(vec![("Ready", "False")]));
        assert_eq!(unknown.ready, Some(ReadyCondition::Unknown));
        assert_eq!(not_ready.ready, Some(ReadyCondition::False));
        assert!(!unknown.is_ready());
        assert!(!not_ready.is_ready());
    }

    #[test]
    fn pod_snapshot_detects_daemonset_mirror_and_local_storage() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("fluentd-x".to_string()),
                namespace: Some("logging".to_string()),
                uid: Some("uid-1".to_string()),
                owner_references: Some(vec![OwnerReference {
                    kind: "DaemonSet".to_string(),
                    name: "fluentd".to_string(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                annotations: Some([(MIRROR_POD_ANNOTATION.to_string(), "abc".to_string())].into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                volumes: Some(vec![Volume {
                    name: "scratch".to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let snapshot = PodSnapshot::from(&pod);
        assert_eq!(snapshot.key(), "logging/fluentd-x");
        assert_eq!(snapshot.uid.as_deref(), Some("uid-1"));
        assert!(snapshot.daemon_set);
        assert!(snapshot.mirror);
        assert!(snapshot.local_storage);
    }

    #[test]
    fn replicaset_owned_pod_is_not_daemonset() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-1".to_string()),
                owner_references: Some(vec![OwnerReference {
                    kind: "ReplicaSet".to_string(),
                    name: "web".to_string(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };

        let snapshot = PodSnapshot::from(&pod);
        assert_eq!(snapshot.namespace, "default");
        assert!(!snapshot.daemon_set);
        assert!(!snapshot.mirror);
        assert!(!snapshot.local_storage);
    }

    #[test]
    fn teardown_progress_names_phase_and_nodes() {
        let progress = TeardownProgress {
            phase: TeardownPhase::Drain,
            node: "n1".to_string(),
            cordoned: vec!["n1".to_string(), "n2".to_string()],
            drained: vec![],
        };
        assert_eq!(
            progress.to_string(),
            "stopped in drain phase at node n1 (cordoned: [n1, n2], drained: [])"
        );
    }
}
