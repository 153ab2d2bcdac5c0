//! Producer registry — resolves the nodes to scrape.

use std::sync::Arc;

use tracing::debug;

use fanin_core::NodeIdentity;

use crate::cluster::ClusterApi;
use crate::error::LookupError;

/// Resolves node identities from the endpoints of a well-known service.
///
/// Every call performs exactly one directory lookup; nothing is cached.
#[derive(Clone)]
pub struct ProducerRegistry {
    cluster: Arc<dyn ClusterApi>,
    service: String,
}

impl ProducerRegistry {
    pub fn new(cluster: Arc<dyn ClusterApi>, service: impl Into<String>) -> Self {
        Self {
            cluster,
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current nodes, in directory order.
    ///
    /// An address without a node name fails the whole resolution: every
    /// consumer downstream labels by name.
    pub async fn resolve(&self, namespace: &str) -> Result<Vec<NodeIdentity>, LookupError> {
        let addresses = self
            .cluster
            .endpoint_addresses(namespace, &self.service)
            .await?;

        let nodes = addresses
            .into_iter()
            .map(|addr| match addr.node_name {
                Some(name) if !name.is_empty() => Ok(NodeIdentity { ip: addr.ip, name }),
                _ => Err(LookupError::MissingNodeName { ip: addr.ip }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            %namespace,
            service = %self.service,
            nodes = nodes.len(),
            "resolved scrape nodes"
        );
        Ok(nodes)
    }
}
