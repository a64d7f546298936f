use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    Api, Client,
    api::{EvictParams, ListParams},
};
use tracing::{Level, instrument};

use crate::{
    ApiError,
    api::{Eviction, NodeSelector, NodeSnapshot, PodSnapshot},
};

/// The narrow slice of the cluster API that node pool lifecycle needs.
///
/// Implementations must not retry internally; callers decide.
#[async_trait]
pub trait NodePoolApi: Send + Sync {
    /// Nodes currently carrying the selector's label.
    async fn list_nodes(&self, selector: &NodeSelector) -> Result<Vec<NodeSnapshot>, ApiError>;

    /// Mark a node unschedulable. Succeeds if it already is.
    async fn cordon_node(&self, node: &str) -> Result<(), ApiError>;

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<PodSnapshot>, ApiError>;

    /// Request eviction of a pod, honoring its termination grace period.
    async fn evict_pod(&self, pod: &PodSnapshot) -> Result<Eviction, ApiError>;

    /// Whether the pod is gone, or has been replaced by a new pod with the same name.
    async fn pod_is_gone(&self, pod: &PodSnapshot) -> Result<bool, ApiError>;
}

/// Number of snapshots whose `Ready` condition is `True`.
pub fn count_ready_nodes(nodes: &[NodeSnapshot]) -> u32 {
    nodes.iter().filter(|node| node.is_ready()).count() as u32
}

/// [`NodePoolApi`] backed by a live API server.
#[derive(Clone)]
pub struct KubeNodePoolApi {
    client: Client,
}

impl KubeNodePoolApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, pod: &PodSnapshot) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &pod.namespace)
    }
}

#[async_trait]
impl NodePoolApi for KubeNodePoolApi {
    #[instrument(level = Level::DEBUG, skip(self))]
    async fn list_nodes(&self, selector: &NodeSelector) -> Result<Vec<NodeSnapshot>, ApiError> {
        let nodes = Api::<Node>::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default().labels(&selector.to_label_selector()))
            .await?;

        Ok(list.items.iter().map(NodeSnapshot::from).collect())
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn cordon_node(&self, node: &str) -> Result<(), ApiError> {
        Api::<Node>::all(self.client.clone()).cordon(node).await?;
        Ok(())
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<PodSnapshot>, ApiError> {
        let pods = Api::<Pod>::all(self.client.clone());
        let list = pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={node}")))
            .await?;

        Ok(list.items.iter().map(PodSnapshot::from).collect())
    }

    async fn evict_pod(&self, pod: &PodSnapshot) -> Result<Eviction, ApiError> {
        match self.pods(pod).evict(&pod.name, &EvictParams::default()).await {
            Ok(_) => Ok(Eviction::Accepted),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(Eviction::AlreadyGone),
            // A disruption budget (or a misconfigured one) is holding the pod back
            Err(kube::Error::Api(e)) if e.code == 429 || e.code == 500 => {
                Ok(Eviction::Blocked(e.message))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn pod_is_gone(&self, pod: &PodSnapshot) -> Result<bool, ApiError> {
        let current = self.pods(pod).get_opt(&pod.name).await?;

        Ok(match current {
            None => true,
            Some(current) => pod.uid.is_some() && current.metadata.uid != pod.uid,
        })
    }
}
