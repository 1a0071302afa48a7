//! # Cluster Transport
//!
//! The seam between the event bus and whatever connects nodes together.
//! Membership, discovery and the wire protocol live behind
//! [`ClusterTransport`]; the bus only asks it three things: which nodes hold
//! a registration for an address, to carry an [`Envelope`] to one node, and
//! to advertise or withdraw the local node's registrations.
//!
//! Inbound traffic flows the other way through the [`EnvelopeSink`] the bus
//! binds on start-up.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::TransportError;
use crate::types::{Headers, NodeId};

/// A message on the wire between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub address: String,
    pub reply_address: Option<String>,
    pub headers: Headers,
    /// Name of the codec that produced `body`.
    pub codec: String,
    pub body: Vec<u8>,
    /// `true` for point-to-point delivery, `false` for publish.
    pub send: bool,
    /// The node the envelope came from; replies route straight back to it.
    pub source: NodeId,
}

/// Inbound side of the transport, implemented by the event bus.
pub trait EnvelopeSink: Send + Sync {
    fn receive(&self, envelope: Envelope);
}

#[async_trait]
pub trait ClusterTransport: Send + Sync + fmt::Debug {
    /// Identity of the local node.
    fn node_id(&self) -> &NodeId;

    /// Called once by the bus to receive inbound envelopes.
    fn bind(&self, sink: Arc<dyn EnvelopeSink>);

    /// Nodes that currently hold at least one advertised registration for
    /// `address`, in a stable order. May include the local node.
    fn nodes_for(&self, address: &str) -> Vec<NodeId>;

    /// Advertise one local registration for `address`.
    async fn add_registration(&self, address: &str) -> Result<(), TransportError>;

    /// Withdraw one local registration for `address`.
    async fn remove_registration(&self, address: &str) -> Result<(), TransportError>;

    /// Carry `envelope` to `node`.
    async fn send(&self, node: &NodeId, envelope: Envelope) -> Result<(), TransportError>;
}
