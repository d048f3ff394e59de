// crates/dispersal-downloader/src/lib.rs

//! The download pipeline: resolve the URI-extension, validate hash trees
//! and shares, reconstruct segments via FEC, and verify plaintext — failing
//! over to another share source rather than aborting on a single bad one.
//!
//! [`ShareReader`] is the collaborator boundary a caller implements for its
//! storage transport.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]

use anyhow::Result;
use dispersal_core::{Capability, Digest, DisperseError, UriExtensionBlock};
use dispersal_crypto::{tagged_hash, tags};
use dispersal_hashtree::HashTree;
use std::collections::HashMap;
use std::io::Write;
use tracing::{debug, info, warn};

/// Everything the downloader can ask a single share source to do. Calls are
/// independent; a source need not preserve state between them beyond what
/// its own share data requires.
pub trait ShareReader {
    /// Fetch the canonical URI-extension block bytes for this share's file.
    ///
    /// # Errors
    /// Any transport failure.
    fn get_uri_extension(&mut self) -> Result<Vec<u8>>;

    /// Fetch this share's complete block hash tree (all nodes).
    ///
    /// # Errors
    /// Any transport failure.
    fn get_block_hash_tree(&mut self) -> Result<Vec<(u64, Digest)>>;

    /// Fetch the `O(log n)` share-hash-tree chain proving this share's leaf.
    ///
    /// # Errors
    /// Any transport failure.
    fn get_share_hash_chain(&mut self) -> Result<Vec<(u64, Digest)>>;

    /// Fetch the complete plaintext hash tree (all nodes).
    ///
    /// # Errors
    /// Any transport failure.
    fn get_plaintext_hash_tree(&mut self) -> Result<Vec<(u64, Digest)>>;

    /// Fetch the complete crypttext hash tree (all nodes).
    ///
    /// # Errors
    /// Any transport failure.
    fn get_crypttext_hash_tree(&mut self) -> Result<Vec<(u64, Digest)>>;

    /// Fetch one segment's erasure-coded block for this share.
    ///
    /// # Errors
    /// Any transport failure.
    fn get_block(&mut self, segment_index: u32) -> Result<Vec<u8>>;
}

/// Per-failure-class counters kept for diagnostics while resolving sources.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FetchFailureCounters {
    /// URI-extension hash didn't match the capability.
    pub uri_extension: u32,
    /// Plaintext hash tree's root didn't match the URI-extension.
    pub plaintext_hashroot: u32,
    /// Plaintext hash tree itself was malformed/inconsistent.
    pub plaintext_hashtree: u32,
    /// Crypttext hash tree's root didn't match the URI-extension.
    pub crypttext_hashroot: u32,
    /// Crypttext hash tree itself was malformed/inconsistent.
    pub crypttext_hashtree: u32,
}

/// Download `capability`'s file from `readers`, writing reconstructed
/// plaintext to `target` in segment order.
///
/// # Errors
/// Returns [`DisperseError::NotEnoughPeers`] if fewer than `k` shares
/// validate. Returns [`DisperseError::BadHash`] if a reconstructed
/// segment's crypttext or plaintext disagrees with its hash-tree leaf.
pub fn download<W: Write>(
    capability: &Capability,
    mut readers: HashMap<u16, Box<dyn ShareReader>>,
    target: &mut W,
) -> Result<(FetchFailureCounters, UriExtensionBlock)> {
    let mut counters = FetchFailureCounters::default();
    let mut order: Vec<u16> = readers.keys().copied().collect();
    order.sort_unstable();
    info!(needed = capability.needed_shares, sources = order.len(), "starting download");

    // Phase 2: URI-extension resolution.
    let mut uri_extension: Option<UriExtensionBlock> = None;
    for &j in &order {
        let reader = readers.get_mut(&j).expect("key came from this map");
        let Ok(bytes) = reader.get_uri_extension() else {
            counters.uri_extension += 1;
            continue;
        };
        if tagged_hash(tags::URI_EXTENSION, &bytes) != capability.uri_extension_hash {
            counters.uri_extension += 1;
            continue;
        }
        let Ok(block) = dispersal_core::io::from_cbor::<UriExtensionBlock>(&bytes) else {
            counters.uri_extension += 1;
            continue;
        };
        if !block.sizes_consistent() {
            counters.uri_extension += 1;
            continue;
        }
        uri_extension = Some(block);
        break;
    }
    let uri_extension = uri_extension
        .ok_or_else(|| DisperseError::NotEnoughPeers {
            needed: capability.needed_shares,
            have: 0,
        })?;

    // Phase 3: hash-tree fetch, trying sources until both trees validate.
    let mut plaintext_tree = HashTree::empty_partial(uri_extension.num_segments as usize);
    let mut crypttext_tree = HashTree::empty_partial(uri_extension.num_segments as usize);
    let mut trees_ok = false;
    for &j in &order {
        let reader = readers.get_mut(&j).expect("key came from this map");
        let mut pt = HashTree::empty_partial(uri_extension.num_segments as usize);
        let mut ct = HashTree::empty_partial(uri_extension.num_segments as usize);

        let Ok(pt_nodes) = reader.get_plaintext_hash_tree() else {
            counters.plaintext_hashtree += 1;
            continue;
        };
        if pt.set_hashes(&pt_nodes).is_err() {
            counters.plaintext_hashtree += 1;
            continue;
        }
        if pt.root() != Some(uri_extension.plaintext_root_hash) {
            counters.plaintext_hashroot += 1;
            continue;
        }

        let Ok(ct_nodes) = reader.get_crypttext_hash_tree() else {
            counters.crypttext_hashtree += 1;
            continue;
        };
        if ct.set_hashes(&ct_nodes).is_err() {
            counters.crypttext_hashtree += 1;
            continue;
        }
        if ct.root() != Some(uri_extension.crypttext_root_hash) {
            counters.crypttext_hashroot += 1;
            continue;
        }

        plaintext_tree = pt;
        crypttext_tree = ct;
        trees_ok = true;
        break;
    }
    if !trees_ok {
        return Err(DisperseError::NotEnoughPeers {
            needed: capability.needed_shares,
            have: 0,
        }
        .into());
    }

    // Phase 4: per-share validation against the share hash tree.
    let mut share_tree = HashTree::empty_partial(uri_extension.total_shares as usize);
    share_tree.set_root(uri_extension.share_root_hash)?;
    let mut validated: HashMap<u16, (HashTree, Box<dyn ShareReader>)> = HashMap::new();
    for &j in &order {
        let mut reader = readers.remove(&j).expect("key came from this map");

        let Ok(chain) = reader.get_share_hash_chain() else {
            continue;
        };
        if share_tree.set_hashes(&chain).is_err() {
            continue;
        }

        let Ok(block_nodes) = reader.get_block_hash_tree() else {
            continue;
        };
        let mut block_tree = HashTree::empty_partial(uri_extension.num_segments as usize);
        if block_tree.set_hashes(&block_nodes).is_err() {
            continue;
        }
        let Some(block_root) = block_tree.root() else {
            continue;
        };
        let share_leaf = tagged_hash(tags::SHARE_LEAF, &block_root);
        if share_tree.verify(j as usize, share_leaf).is_err() {
            continue;
        }

        validated.insert(j, (block_tree, reader));
    }

    if (validated.len() as u16) < uri_extension.needed_shares {
        return Err(DisperseError::NotEnoughPeers {
            needed: uri_extension.needed_shares,
            have: validated.len() as u16,
        }
        .into());
    }
    debug!(validated = validated.len(), "shares validated");

    // Phase 5 & 6: per-segment reconstruction, decrypt, and plaintext check.
    let mut live: Vec<u16> = validated.keys().copied().collect();
    live.sort_unstable();

    for segno in 0..uri_extension.num_segments {
        if (live.len() as u16) < uri_extension.needed_shares {
            return Err(DisperseError::NotEnoughPeers {
                needed: uri_extension.needed_shares,
                have: live.len() as u16,
            }
            .into());
        }

        let mut blocks: Vec<(u16, Vec<u8>)> = Vec::new();
        let mut dead = Vec::new();
        for &j in &live {
            if (blocks.len() as u16) >= uri_extension.needed_shares {
                break;
            }
            let (block_tree, reader) = validated.get_mut(&j).expect("live implies validated");
            let Ok(block) = reader.get_block(segno) else {
                dead.push(j);
                continue;
            };
            let leaf = tagged_hash(tags::BLOCK_LEAF, &block);
            if block_tree.verify(segno as usize, leaf).is_err() {
                dead.push(j);
                continue;
            }
            blocks.push((j, block));
        }
        if !dead.is_empty() {
            warn!(segno, dropped = ?dead, "dropping shares that failed this segment");
        }
        live.retain(|j| !dead.contains(j));
        if (blocks.len() as u16) < uri_extension.needed_shares {
            return Err(DisperseError::NotEnoughPeers {
                needed: uri_extension.needed_shares,
                have: blocks.len() as u16,
            }
            .into());
        }

        let this_segment_len =
            segment_len(uri_extension.size, uri_extension.segment_size, segno);
        let crypttext = dispersal_fec::decode(
            &blocks,
            uri_extension.needed_shares,
            uri_extension.total_shares,
            this_segment_len,
        )?;
        let crypttext_leaf = tagged_hash(tags::CRYPTTEXT_LEAF, &crypttext);
        crypttext_tree.verify(segno as usize, crypttext_leaf)?;

        let offset = u64::from(segno) * u64::from(uri_extension.segment_size);
        let plaintext = dispersal_crypto::decrypt(&capability.key, offset, &crypttext);
        let plaintext_leaf = tagged_hash(tags::PLAINTEXT_LEAF, &plaintext);
        plaintext_tree.verify(segno as usize, plaintext_leaf)?;

        target.write_all(&plaintext)?;
    }

    info!(segments = uri_extension.num_segments, "download complete");
    Ok((counters, uri_extension))
}

fn segment_len(file_size: u64, segment_size: u32, segno: u32) -> usize {
    if file_size == 0 {
        return 0;
    }
    let start = u64::from(segno) * u64::from(segment_size);
    let remaining = file_size - start;
    remaining.min(u64::from(segment_size)) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispersal_encoder::{Encoder, EncoderParams, ShareWriter};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct InMemoryShare {
        blocks: HashMap<u32, Vec<u8>>,
        block_hashes: Vec<(u64, Digest)>,
        share_hashes: Vec<(u64, Digest)>,
        plaintext_hashes: Vec<(u64, Digest)>,
        crypttext_hashes: Vec<(u64, Digest)>,
        uri_extension: Vec<u8>,
    }

    struct RecordingWriter {
        share: Arc<Mutex<InMemoryShare>>,
    }

    impl ShareWriter for RecordingWriter {
        fn put_block(&mut self, segment_index: u32, data: &[u8]) -> Result<()> {
            self.share.lock().unwrap().blocks.insert(segment_index, data.to_vec());
            Ok(())
        }
        fn put_block_hashes(&mut self, hashes: &[(u64, Digest)]) -> Result<()> {
            self.share.lock().unwrap().block_hashes = hashes.to_vec();
            Ok(())
        }
        fn put_share_hashes(&mut self, hashes: &[(u64, Digest)]) -> Result<()> {
            self.share.lock().unwrap().share_hashes = hashes.to_vec();
            Ok(())
        }
        fn put_plaintext_hashes(&mut self, hashes: &[(u64, Digest)]) -> Result<()> {
            self.share.lock().unwrap().plaintext_hashes = hashes.to_vec();
            Ok(())
        }
        fn put_crypttext_hashes(&mut self, hashes: &[(u64, Digest)]) -> Result<()> {
            self.share.lock().unwrap().crypttext_hashes = hashes.to_vec();
            Ok(())
        }
        fn put_uri_extension(&mut self, bytes: &[u8]) -> Result<()> {
            self.share.lock().unwrap().uri_extension = bytes.to_vec();
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct InMemoryReader {
        share: Arc<Mutex<InMemoryShare>>,
        fail_blocks_from: Option<u32>,
    }

    impl ShareReader for InMemoryReader {
        fn get_uri_extension(&mut self) -> Result<Vec<u8>> {
            Ok(self.share.lock().unwrap().uri_extension.clone())
        }
        fn get_block_hash_tree(&mut self) -> Result<Vec<(u64, Digest)>> {
            Ok(self.share.lock().unwrap().block_hashes.clone())
        }
        fn get_share_hash_chain(&mut self) -> Result<Vec<(u64, Digest)>> {
            Ok(self.share.lock().unwrap().share_hashes.clone())
        }
        fn get_plaintext_hash_tree(&mut self) -> Result<Vec<(u64, Digest)>> {
            Ok(self.share.lock().unwrap().plaintext_hashes.clone())
        }
        fn get_crypttext_hash_tree(&mut self) -> Result<Vec<(u64, Digest)>> {
            Ok(self.share.lock().unwrap().crypttext_hashes.clone())
        }
        fn get_block(&mut self, segment_index: u32) -> Result<Vec<u8>> {
            if let Some(limit) = self.fail_blocks_from {
                if segment_index >= limit {
                    anyhow::bail!("share gone");
                }
            }
            self.share
                .lock()
                .unwrap()
                .blocks
                .get(&segment_index)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such block"))
        }
    }

    struct Fixture {
        capability: Capability,
        shares: HashMap<u16, Arc<Mutex<InMemoryShare>>>,
    }

    fn upload_fixture(plaintext: &[u8], key: Vec<u8>, k: u16, happy: u16, n: u16) -> Fixture {
        let mut shares = HashMap::new();
        let mut writers: HashMap<u16, Box<dyn ShareWriter>> = HashMap::new();
        for j in 0..n {
            let share = Arc::new(Mutex::new(InMemoryShare::default()));
            shares.insert(j, share.clone());
            writers.insert(j, Box::new(RecordingWriter { share }));
        }
        let mut enc = Encoder::set_encrypted_uploadable(
            Cursor::new(plaintext.to_vec()),
            plaintext.len() as u64,
            key.clone(),
            EncoderParams {
                k,
                happy,
                n,
                max_segment_size: 16,
            },
        )
        .unwrap();
        enc.set_shareholders(writers).unwrap();
        let result = enc.start().unwrap();

        let capability =
            Capability::new(key, result.uri_extension_hash, k, n, plaintext.len() as u64).unwrap();
        Fixture { capability, shares }
    }

    fn readers_from(
        fixture: &Fixture,
        fail_blocks_from: HashMap<u16, u32>,
    ) -> HashMap<u16, Box<dyn ShareReader>> {
        fixture
            .shares
            .iter()
            .map(|(&j, share)| {
                let reader: Box<dyn ShareReader> = Box::new(InMemoryReader {
                    share: share.clone(),
                    fail_blocks_from: fail_blocks_from.get(&j).copied(),
                });
                (j, reader)
            })
            .collect()
    }

    #[test]
    fn full_roundtrip_with_all_shares_present() {
        let plaintext = b"the quick brown fox jumps over the lazy dog, and then some more".to_vec();
        let fixture = upload_fixture(&plaintext, vec![5u8; 16], 3, 4, 5);
        let readers = readers_from(&fixture, HashMap::new());

        let mut out = Vec::new();
        let (counters, uri_ext) = download(&fixture.capability, readers, &mut out).unwrap();
        assert_eq!(out, plaintext);
        assert_eq!(counters, FetchFailureCounters::default());
        assert_eq!(uri_ext.size, plaintext.len() as u64);
    }

    #[test]
    fn roundtrip_survives_losing_shares_above_k() {
        let plaintext = vec![42u8; 50];
        let fixture = upload_fixture(&plaintext, vec![2u8; 16], 3, 5, 5);
        let mut fail_from = HashMap::new();
        fail_from.insert(0u16, 0u32);
        fail_from.insert(1u16, 0u32);
        let readers = readers_from(&fixture, fail_from);

        let mut out = Vec::new();
        download(&fixture.capability, readers, &mut out).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn fails_with_not_enough_peers_when_too_few_shares_survive() {
        let plaintext = vec![7u8; 30];
        let fixture = upload_fixture(&plaintext, vec![9u8; 16], 3, 5, 5);
        let mut fail_from = HashMap::new();
        fail_from.insert(0u16, 0u32);
        fail_from.insert(1u16, 0u32);
        fail_from.insert(2u16, 0u32);
        let readers = readers_from(&fixture, fail_from);

        let mut out = Vec::new();
        let err = download(&fixture.capability, readers, &mut out).unwrap_err();
        assert!(err.downcast_ref::<DisperseError>().is_some());
    }

    #[test]
    fn wrong_key_fails_plaintext_check() {
        let plaintext = vec![3u8; 20];
        let fixture = upload_fixture(&plaintext, vec![1u8; 16], 2, 2, 3);
        let readers = readers_from(&fixture, HashMap::new());

        let wrong_capability = Capability::new(
            vec![2u8; 16],
            fixture.capability.uri_extension_hash,
            fixture.capability.needed_shares,
            fixture.capability.total_shares,
            fixture.capability.size,
        )
        .unwrap();

        let mut out = Vec::new();
        let err = download(&wrong_capability, readers, &mut out).unwrap_err();
        assert!(err.downcast_ref::<DisperseError>().is_some());
    }
}
