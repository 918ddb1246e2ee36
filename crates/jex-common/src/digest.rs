//! Identity digests for deduplicating exported objects

use crate::error::{JexError, Result};
use sha2::{Digest, Sha256};

/// Raw identity digest of one logical object.
///
/// The length is fixed per object type: 32 bytes for derived SHA-256
/// identities, 20 bytes for intrinsic `sha1_git` style identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Vec<u8>);

impl NodeId {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        NodeId(bytes.into())
    }

    /// Parse a hex-encoded identifier
    pub fn from_hex(object_type: &str, value: &str) -> Result<Self> {
        hex::decode(value)
            .map(NodeId)
            .map_err(|e| JexError::invalid_object(object_type, format!("bad hex id '{}': {}", value, e)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// SHA-256 of arbitrary bytes
pub fn sha256(data: impl AsRef<[u8]>) -> NodeId {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    NodeId(hasher.finalize().to_vec())
}
