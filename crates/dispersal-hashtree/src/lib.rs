// crates/dispersal-hashtree/src/lib.rs

//! A balanced binary hash tree over a fixed-size, power-of-two-padded leaf
//! list, addressed in heap order (root at index 0; children of `i` at
//! `2i+1`, `2i+2`).
//!
//! The tree accepts **pre-hashed** leaves rather than hashing raw bytes
//! itself: the four leaf kinds used across the workspace (block, share,
//! plaintext, crypttext) each carry their own domain tag, so the caller
//! tags a leaf before handing it to [`HashTree::build`]. Internal nodes are
//! always `tagged_hash2("node", left, right)`.
//!
//! Two usage modes share one representation:
//! - **Full tree** ([`HashTree::build`]): every node present, used by a
//!   producer to compute the root and extract authenticated chains.
//! - **Partial tree** ([`HashTree::empty_partial`]): nodes filled in
//!   incrementally via [`HashTree::set_hashes`] and [`HashTree::verify`] as
//!   a consumer receives chains — any two hashes ever asserted for the same
//!   node index must agree, or the tree reports [`DisperseError::BadHash`].

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]

use dispersal_core::{Digest, DisperseError};
use dispersal_crypto::{tagged_hash, tagged_hash2, tags};

/// A heap-indexed binary hash tree, full or partially populated.
#[derive(Clone, Debug)]
pub struct HashTree {
    nodes: Vec<Option<Digest>>,
    /// Real (unpadded) leaf count this tree was built or sized for.
    num_leaves: usize,
    /// Leaf count after padding to the next power of two.
    padded_leaves: usize,
}

impl HashTree {
    /// Build a full tree over already-tagged leaf hashes, padding with the
    /// `empty` sentinel up to the next power of two.
    #[must_use]
    pub fn build(leaf_hashes: &[Digest]) -> Self {
        let num_leaves = leaf_hashes.len();
        let padded_leaves = padded_len(num_leaves);
        let empty_leaf = tagged_hash(tags::EMPTY_LEAF, &[]);

        let mut nodes = vec![None; 2 * padded_leaves - 1];
        let base = padded_leaves - 1;
        for (i, slot) in nodes[base..].iter_mut().enumerate() {
            *slot = Some(leaf_hashes.get(i).copied().unwrap_or(empty_leaf));
        }

        let mut level_start = base;
        let mut level_len = padded_leaves;
        while level_len > 1 {
            let parent_start = (level_start - 1) / 2;
            for i in 0..level_len / 2 {
                let left = nodes[level_start + 2 * i].expect("level fully populated");
                let right = nodes[level_start + 2 * i + 1].expect("level fully populated");
                nodes[parent_start + i] = Some(tagged_hash2(tags::NODE, &left, &right));
            }
            level_len /= 2;
            level_start = parent_start;
        }

        Self {
            nodes,
            num_leaves,
            padded_leaves,
        }
    }

    /// Create an empty partial tree sized for `num_leaves` real leaves
    /// (padded the same way [`Self::build`] would), with no nodes known yet.
    #[must_use]
    pub fn empty_partial(num_leaves: usize) -> Self {
        let padded_leaves = padded_len(num_leaves);
        Self {
            nodes: vec![None; 2 * padded_leaves - 1],
            num_leaves,
            padded_leaves,
        }
    }

    /// Number of real (unpadded) leaves.
    #[must_use]
    pub fn num_leaves(&self) -> usize {
        self.num_leaves
    }

    /// Number of leaves after power-of-two padding.
    #[must_use]
    pub fn padded_leaves(&self) -> usize {
        self.padded_leaves
    }

    /// The root hash, if known.
    #[must_use]
    pub fn root(&self) -> Option<Digest> {
        self.nodes[0]
    }

    /// Seed the root of a partial tree from an externally-trusted value
    /// (e.g. the URI-extension block's `share_root_hash`), so later
    /// [`Self::verify`] calls have something to check against.
    ///
    /// # Errors
    /// Returns [`DisperseError::BadHash`] if a different root was already set.
    pub fn set_root(&mut self, root: Digest) -> Result<(), DisperseError> {
        self.set_hashes(&[(0, root)])
    }

    /// The sibling chain from `leaf_index` up to (but not including) the
    /// root, in bottom-up order, as `(node_index, hash)` pairs.
    ///
    /// # Panics
    /// Panics if any required node is unset — only call on a fully built tree.
    #[must_use]
    pub fn needed_hashes(&self, leaf_index: usize) -> Vec<(u64, Digest)> {
        assert!(leaf_index < self.padded_leaves, "leaf index out of range");
        let mut out = Vec::new();
        let mut idx = leaf_base(self.padded_leaves) + leaf_index;
        while idx != 0 {
            let sib = sibling_index(idx);
            let hash = self.nodes[sib].expect("needed_hashes requires a fully built tree");
            out.push((sib as u64, hash));
            idx = parent_index(idx);
        }
        out
    }

    /// Dump every currently-known node as `(node_index, hash)` pairs, in
    /// index order. On a fully built tree this is the whole tree; a
    /// downloader uses it to transfer e.g. a complete block hash tree in
    /// one message so later single-leaf verification needs no more round
    /// trips.
    #[must_use]
    pub fn all_nodes(&self) -> Vec<(u64, Digest)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, h)| h.map(|h| (i as u64, h)))
            .collect()
    }

    /// Insert a received chain (or any set of node assertions). Fails if any
    /// entry disagrees with a value already accepted at that index.
    ///
    /// # Errors
    /// Returns [`DisperseError::BadHash`] on the first conflicting entry.
    pub fn set_hashes(&mut self, hashes: &[(u64, Digest)]) -> Result<(), DisperseError> {
        for &(idx, hash) in hashes {
            let idx = idx as usize;
            match self.nodes.get(idx).copied().flatten() {
                Some(existing) if existing != hash => {
                    return Err(DisperseError::bad_hash(idx as u64, &existing, &hash));
                }
                Some(_) => {}
                None => self.nodes[idx] = Some(hash),
            }
        }
        Ok(())
    }

    /// Walk up from `leaf_index` combining `leaf_hash` with the sibling
    /// hashes already recorded in this partial tree (via prior
    /// [`Self::set_hashes`] calls), deriving each ancestor and checking the
    /// final value against the tree's root.
    ///
    /// The sibling chain comes from a remote, potentially adversarial share
    /// source, so a missing sibling (a peer that withholds part of its
    /// chain, e.g. the `missing_sharehash` category) is treated the same as
    /// a mismatched one: a verification failure for this leaf, not a panic.
    ///
    /// # Errors
    /// Returns [`DisperseError::BadHash`] if the leaf, an ancestor, or the
    /// root disagrees with a previously accepted value, or if a sibling
    /// required to reach the root was never supplied.
    pub fn verify(&mut self, leaf_index: usize, leaf_hash: Digest) -> Result<(), DisperseError> {
        assert!(leaf_index < self.padded_leaves, "leaf index out of range");
        let mut idx = leaf_base(self.padded_leaves) + leaf_index;
        self.set_hashes(&[(idx as u64, leaf_hash)])?;

        let mut current = leaf_hash;
        while idx != 0 {
            let sib_idx = sibling_index(idx);
            let Some(sib) = self.nodes[sib_idx] else {
                return Err(DisperseError::BadHash {
                    node_index: sib_idx as u64,
                    expected: "<unset>".to_string(),
                    actual: "<missing from chain>".to_string(),
                });
            };
            let parent = if is_left_child(idx) {
                tagged_hash2(tags::NODE, &current, &sib)
            } else {
                tagged_hash2(tags::NODE, &sib, &current)
            };
            let p_idx = parent_index(idx);
            self.set_hashes(&[(p_idx as u64, parent)])?;
            current = parent;
            idx = p_idx;
        }
        Ok(())
    }
}

#[inline]
fn padded_len(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

#[inline]
fn leaf_base(padded_leaves: usize) -> usize {
    padded_leaves - 1
}

#[inline]
fn parent_index(i: usize) -> usize {
    (i - 1) / 2
}

#[inline]
fn sibling_index(i: usize) -> usize {
    if i % 2 == 1 {
        i + 1
    } else {
        i - 1
    }
}

#[inline]
fn is_left_child(i: usize) -> bool {
    i % 2 == 1
}
