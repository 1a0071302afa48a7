use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Type-erased message body.
///
/// Bodies are shared rather than cloned so that a publish to many local
/// handlers hands every handler the same allocation.
pub type Body = Arc<dyn Any + Send + Sync>;

/// Message headers, ordered so that encoded envelopes are stable.
pub type Headers = BTreeMap<String, String>;

/// Identifier handed out for every handler registration, standing or one-shot.
pub type RegistrationId = u64;

/// Identity of a node in a cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}
