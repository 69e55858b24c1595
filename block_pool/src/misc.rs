use std::sync::Arc;

use derive_more::Display;

pub type Height = u64;

/// A block as seen by the pool. The pool never looks inside it apart from reading its height.
pub trait Block: Send + Sync + 'static {
    fn height(&self) -> Height;
}

/// Opaque peer identifier assigned by the transport layer.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub struct PeerId(Arc<str>);

impl PeerId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(peer_id: &str) -> Self {
        Self(peer_id.into())
    }
}

impl From<String> for PeerId {
    fn from(peer_id: String) -> Self {
        Self(peer_id.into())
    }
}
