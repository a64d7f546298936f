use tracing::{Level, instrument};

use crate::{Error, Result, nodes::NodePoolApi};

/// Mark `node` unschedulable. Running pods are left alone; cordoning twice is fine.
#[instrument(level = Level::DEBUG, skip(api))]
pub async fn cordon<A: NodePoolApi + ?Sized>(api: &A, node: &str) -> Result<()> {
    tracing::debug!("cordoning node {node}");

    api.cordon_node(node).await.map_err(|source| Error::Cordon {
        node: node.to_string(),
        source,
    })
}
