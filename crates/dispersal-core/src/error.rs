//! Distinct, observable error kinds shared across the dispersal workspace.
//!
//! These name the failures §7 of the specification calls out explicitly;
//! everything else (a single collaborator RPC failing, a peer going away)
//! is not a distinct kind — it collapses into "this peer is dead for this
//! operation" at the call site rather than propagating as its own error.

use thiserror::Error;

/// Observable failure kinds for hash validation, FEC decoding, and the
/// upload/download peer-count thresholds.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum DisperseError {
    /// A hash check failed: a hash-tree node, root, or leaf mismatch, or a
    /// decrypt-then-hash mismatch at the plaintext boundary.
    #[error("hash mismatch at node {node_index}: expected {expected}, got {actual}")]
    BadHash {
        /// Heap index of the offending node (or `u64::MAX` for a top-level
        /// root/leaf comparison that has no single node index).
        node_index: u64,
        /// Hex-encoded expected digest.
        expected: String,
        /// Hex-encoded actual digest.
        actual: String,
    },

    /// Fewer live writers (upload) or validated readers (download) remain
    /// than the configured threshold requires.
    #[error("not enough peers: needed {needed}, have {have}")]
    NotEnoughPeers {
        /// Minimum required count (`happy` on upload, `k` on download).
        needed: u16,
        /// Count actually available.
        have: u16,
    },

    /// The FEC decoder was given fewer than `k` blocks.
    #[error("not enough blocks to decode: needed {needed}, got {got}")]
    NotEnoughBlocks {
        /// Required block count (`k`).
        needed: u16,
        /// Blocks actually supplied.
        got: u16,
    },
}

impl DisperseError {
    /// Construct a [`DisperseError::BadHash`] from two 32-byte digests.
    #[must_use]
    pub fn bad_hash(node_index: u64, expected: &[u8; 32], actual: &[u8; 32]) -> Self {
        Self::BadHash {
            node_index,
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        }
    }
}
