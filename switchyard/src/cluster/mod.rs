//! Cluster transports. The event bus talks to any
//! [`ClusterTransport`](switchyard_api::cluster::ClusterTransport); this
//! module ships the in-process one.

mod memory;

pub use memory::{InMemoryCluster, InMemoryTransport};
