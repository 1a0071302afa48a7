use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use switchyard_api::cluster::{ClusterTransport, Envelope, EnvelopeSink};
use switchyard_api::errors::TransportError;
use switchyard_api::types::NodeId;

#[derive(Default)]
struct Hub {
    sinks: Mutex<HashMap<NodeId, Arc<dyn EnvelopeSink>>>,
    // address -> node -> advertised registrations
    routes: Mutex<HashMap<String, BTreeMap<NodeId, usize>>>,
    next_node: AtomicUsize,
}

/// A cluster whose nodes live in one process.
///
/// Every runtime that joins gets an [`InMemoryTransport`]; envelopes are
/// handed straight to the target node's bus. Useful for tests and for
/// running several isolated runtimes side by side.
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    hub: Arc<Hub>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join with a generated node id.
    pub fn join(&self) -> Arc<InMemoryTransport> {
        let index = self.hub.next_node.fetch_add(1, Ordering::Relaxed);
        self.join_as(NodeId::new(format!("node-{index}")))
    }

    pub fn join_as(&self, node: NodeId) -> Arc<InMemoryTransport> {
        crate::log_lifecycle!("cluster", node.as_str(), "joined");
        Arc::new(InMemoryTransport { node, cluster: self.clone() })
    }

    /// Remove `node` and every registration it advertised.
    pub fn leave(&self, node: &NodeId) {
        self.hub.sinks.lock().remove(node);
        let mut routes = self.hub.routes.lock();
        for nodes in routes.values_mut() {
            nodes.remove(node);
        }
        routes.retain(|_, nodes| !nodes.is_empty());
        crate::log_lifecycle!("cluster", node.as_str(), "left");
    }

    /// Nodes that are bound and reachable.
    pub fn members(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self.hub.sinks.lock().keys().cloned().collect();
        members.sort();
        members
    }

    /// Total registrations advertised for `address` across the cluster.
    pub fn registrations(&self, address: &str) -> usize {
        self.hub.routes.lock().get(address).map_or(0, |nodes| nodes.values().sum())
    }
}

impl fmt::Debug for InMemoryCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCluster").field("members", &self.members()).finish()
    }
}

/// One node's view of an [`InMemoryCluster`].
pub struct InMemoryTransport {
    node: NodeId,
    cluster: InMemoryCluster,
}

impl InMemoryTransport {
    pub fn cluster(&self) -> &InMemoryCluster {
        &self.cluster
    }
}

impl fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTransport").field("node", &self.node).finish()
    }
}

#[async_trait]
impl ClusterTransport for InMemoryTransport {
    fn node_id(&self) -> &NodeId {
        &self.node
    }

    fn bind(&self, sink: Arc<dyn EnvelopeSink>) {
        self.cluster.hub.sinks.lock().insert(self.node.clone(), sink);
    }

    fn nodes_for(&self, address: &str) -> Vec<NodeId> {
        self.cluster
            .hub
            .routes
            .lock()
            .get(address)
            .map(|nodes| nodes.iter().filter(|(_, count)| **count > 0).map(|(node, _)| node.clone()).collect())
            .unwrap_or_default()
    }

    async fn add_registration(&self, address: &str) -> Result<(), TransportError> {
        *self
            .cluster
            .hub
            .routes
            .lock()
            .entry(address.to_string())
            .or_default()
            .entry(self.node.clone())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn remove_registration(&self, address: &str) -> Result<(), TransportError> {
        let mut routes = self.cluster.hub.routes.lock();
        if let Some(nodes) = routes.get_mut(address) {
            if let Some(count) = nodes.get_mut(&self.node) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    nodes.remove(&self.node);
                }
            }
            if nodes.is_empty() {
                routes.remove(address);
            }
        }
        Ok(())
    }

    async fn send(&self, node: &NodeId, envelope: Envelope) -> Result<(), TransportError> {
        let sink = self
            .cluster
            .hub
            .sinks
            .lock()
            .get(node)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(node.clone()))?;
        sink.receive(envelope);
        Ok(())
    }
}
