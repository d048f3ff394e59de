// crates/dispersal-core/src/types.rs

//! Canonical data-model types shared across the dispersal workspace.
//!
//! These mirror §3 of the specification: the URI-extension block from which
//! all integrity of a file transitively derives, plus the small index/count
//! aliases used at every component boundary.

use serde::{Deserialize, Serialize};

/// Index of one of the `n` shares, in `[0, n)`.
pub type ShareIndex = u16;

/// Zero-based segment number, in `[0, num_segments)`.
pub type SegmentIndex = u32;

/// A 32-byte tagged hash (BLAKE3 output, see `dispersal_crypto::tagged_hash`).
pub type Digest = [u8; 32];

/// The structured URI-extension record (§3, §6).
///
/// Canonical encoding is CBOR (`ciborium`) over this struct in field-declared
/// order; `dispersal_crypto::tagged_hash("uri_extension", &canonical_bytes)`
/// produces the 32-byte hash embedded in the [`crate::Capability`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UriExtensionBlock {
    /// Plaintext file size in bytes.
    pub size: u64,
    /// Size of each segment (the last segment may be shorter).
    pub segment_size: u32,
    /// `ceil(size / segment_size)`.
    pub num_segments: u32,
    /// FEC `k` (shares needed to reconstruct).
    pub needed_shares: ShareIndex,
    /// FEC `n` (total shares produced).
    pub total_shares: ShareIndex,
    /// Root of the share hash tree (leaves = block-hash-tree roots, one per share).
    pub share_root_hash: Digest,
    /// Root of the plaintext hash tree (leaves = per-segment plaintext hashes).
    pub plaintext_root_hash: Digest,
    /// Root of the crypttext hash tree (leaves = per-segment crypttext hashes).
    pub crypttext_root_hash: Digest,
}

/// Encoder-side bookkeeping for one of the `n` shareholders across an
/// upload.
///
/// Tracked independently of the `ShareWriter` transport itself so an
/// encoder can answer "how far did this share get before it died" without
/// re-deriving it from the collaborator's own (possibly now-unreachable)
/// state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShareholderRecord {
    /// Which of the `n` shares this record tracks.
    pub share_index: ShareIndex,
    /// Segments successfully written via `put_block` so far.
    pub blocks_sent: u32,
    /// Whether all four hash-tree `put_*_hashes` calls have succeeded.
    pub hashes_sent: bool,
    /// Whether `put_uri_extension` has succeeded.
    pub uri_extension_sent: bool,
    /// Whether `close` has succeeded.
    pub closed: bool,
    /// `false` once any call to this shareholder has failed; a dead
    /// shareholder is never retried.
    pub alive: bool,
}

impl ShareholderRecord {
    /// A fresh record for `share_index`, alive with nothing sent yet.
    #[must_use]
    pub fn new(share_index: ShareIndex) -> Self {
        Self {
            share_index,
            blocks_sent: 0,
            hashes_sent: false,
            uri_extension_sent: false,
            closed: false,
            alive: true,
        }
    }

    /// Mark this shareholder dead; it is excluded from all further sends.
    pub fn mark_dead(&mut self) {
        self.alive = false;
    }
}

impl UriExtensionBlock {
    /// `true` iff `size` is consistent with `num_segments` and `segment_size`
    /// per the invariant in §3: `size <= num_segments * segment_size` and
    /// `size > (num_segments - 1) * segment_size`.
    #[inline]
    #[must_use]
    pub fn sizes_consistent(&self) -> bool {
        let seg = u64::from(self.segment_size);
        let n = u64::from(self.num_segments);
        if n == 0 {
            return self.size == 0;
        }
        self.size <= n * seg && self.size > (n - 1) * seg
    }
}
