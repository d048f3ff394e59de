// crates/dispersal-encoder/src/lib.rs

//! The upload pipeline: reads plaintext in segments, hashes, encrypts,
//! erasure-encodes, and commits the result to `n` shareholders with a
//! happiness threshold.
//!
//! [`ShareWriter`] is the collaborator boundary a caller implements for its
//! storage transport; everything upstream of it (segmentation, hashing,
//! encryption, FEC, hash-tree construction) lives in [`Encoder`].

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]

use anyhow::{ensure, Result};
use dispersal_core::{Digest, DisperseError, ShareholderRecord, UriExtensionBlock};
use dispersal_crypto::{tagged_hash, tags};
use dispersal_hashtree::HashTree;
use std::collections::HashMap;
use std::io::Read;
use tracing::{debug, info};

/// Everything the encoder can ask a single shareholder to do, in the strict
/// per-share order: blocks (segment order), then metadata, then
/// uri-extension, then close.
///
/// A returned `Err` from any method marks this shareholder dead for the
/// rest of the upload; it is not retried, and nothing else is sent to it.
pub trait ShareWriter {
    /// Store one segment's erasure-coded block for this share.
    ///
    /// # Errors
    /// Any transport failure; the shareholder is marked dead.
    fn put_block(&mut self, segment_index: u32, data: &[u8]) -> Result<()>;

    /// Store this share's complete block hash tree (all nodes).
    ///
    /// # Errors
    /// Any transport failure; the shareholder is marked dead.
    fn put_block_hashes(&mut self, hashes: &[(u64, Digest)]) -> Result<()>;

    /// Store the `O(log n)` share-hash-tree chain proving this share's leaf.
    ///
    /// # Errors
    /// Any transport failure; the shareholder is marked dead.
    fn put_share_hashes(&mut self, hashes: &[(u64, Digest)]) -> Result<()>;

    /// Store the complete plaintext hash tree (all nodes).
    ///
    /// # Errors
    /// Any transport failure; the shareholder is marked dead.
    fn put_plaintext_hashes(&mut self, hashes: &[(u64, Digest)]) -> Result<()>;

    /// Store the complete crypttext hash tree (all nodes).
    ///
    /// # Errors
    /// Any transport failure; the shareholder is marked dead.
    fn put_crypttext_hashes(&mut self, hashes: &[(u64, Digest)]) -> Result<()>;

    /// Store the canonical URI-extension block bytes.
    ///
    /// # Errors
    /// Any transport failure; the shareholder is marked dead.
    fn put_uri_extension(&mut self, bytes: &[u8]) -> Result<()>;

    /// Finalize this share. No further writes follow.
    ///
    /// # Errors
    /// Any transport failure; the shareholder is marked dead.
    fn close(&mut self) -> Result<()>;
}

/// The `(k, happy, n)` share-count parameters and per-segment size cap.
#[derive(Clone, Copy, Debug)]
pub struct EncoderParams {
    /// Shares needed to reconstruct.
    pub k: u16,
    /// Minimum live shareholders required at every checkpoint.
    pub happy: u16,
    /// Total shares produced.
    pub n: u16,
    /// Upper bound on segment size; the actual segment size is
    /// `min(max_segment_size, file_size)`.
    pub max_segment_size: u32,
}

/// A queryable encoder parameter, mirroring the collaborator's `get_param`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Param {
    /// `(k, happy, n)`.
    ShareCounts,
    /// Number of segments the file was divided into.
    NumSegments,
    /// The segment size in bytes (the last segment may be shorter).
    SegmentSize,
}

/// The value returned for a queried [`Param`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParamValue {
    /// `(k, happy, n)`.
    ShareCounts(u16, u16, u16),
    /// Segment count.
    NumSegments(u32),
    /// Segment size in bytes.
    SegmentSize(u32),
}

/// Outcome of a completed upload.
#[derive(Clone, Copy, Debug)]
pub struct UploadResult {
    /// Hash of the canonical URI-extension block (the capability's anchor).
    pub uri_extension_hash: Digest,
    /// Shares needed to reconstruct.
    pub k: u16,
    /// Total shares produced.
    pub n: u16,
    /// Plaintext file size in bytes.
    pub file_size: u64,
}

/// Drives one upload: segmentation, per-segment fan-out to shareholders,
/// then hash-tree construction and metadata commit.
pub struct Encoder<R> {
    source: R,
    file_size: u64,
    key: Vec<u8>,
    params: EncoderParams,
    segment_size: u32,
    num_segments: u32,
    shareholders: HashMap<u16, Box<dyn ShareWriter>>,
}

impl<R: Read> Encoder<R> {
    /// Establish the segmenter and parameters for `source`, a plaintext
    /// stream of exactly `file_size` bytes, to be encrypted under `key`.
    ///
    /// # Errors
    /// Returns an error if `params.k == 0`, `params.n < params.k`,
    /// `params.happy > params.n`, or `params.max_segment_size == 0`.
    pub fn set_encrypted_uploadable(
        source: R,
        file_size: u64,
        key: Vec<u8>,
        params: EncoderParams,
    ) -> Result<Self> {
        ensure!(params.k > 0, "k must be positive");
        ensure!(params.n >= params.k, "n must be >= k");
        ensure!(params.happy <= params.n, "happy must be <= n");
        ensure!(params.max_segment_size > 0, "max_segment_size must be positive");

        let (segment_size, num_segments) = if file_size == 0 {
            (0, 1)
        } else {
            let segment_size = u64::from(params.max_segment_size).min(file_size);
            let num_segments = file_size.div_ceil(segment_size);
            (
                u32::try_from(segment_size).unwrap_or(u32::MAX),
                u32::try_from(num_segments).unwrap_or(u32::MAX),
            )
        };

        Ok(Self {
            source,
            file_size,
            key,
            params,
            segment_size,
            num_segments,
            shareholders: HashMap::new(),
        })
    }

    /// Query a derived parameter.
    #[must_use]
    pub fn get_param(&self, which: Param) -> ParamValue {
        match which {
            Param::ShareCounts => {
                ParamValue::ShareCounts(self.params.k, self.params.happy, self.params.n)
            }
            Param::NumSegments => ParamValue::NumSegments(self.num_segments),
            Param::SegmentSize => ParamValue::SegmentSize(self.segment_size),
        }
    }

    /// Register exactly `n` shareholders, one per share index in `[0, n)`.
    ///
    /// # Errors
    /// Returns an error if the map's size or key range don't match `n`.
    pub fn set_shareholders(&mut self, writers: HashMap<u16, Box<dyn ShareWriter>>) -> Result<()> {
        ensure!(
            writers.len() as u16 == self.params.n,
            "expected exactly {} shareholders, got {}",
            self.params.n,
            writers.len()
        );
        for idx in writers.keys() {
            ensure!(*idx < self.params.n, "share index {idx} out of range");
        }
        self.shareholders = writers;
        Ok(())
    }

    /// Run the full pipeline: segment, hash, encrypt, FEC-encode, commit.
    ///
    /// # Errors
    /// Returns [`DisperseError::NotEnoughPeers`] if live shareholders drop
    /// below `happy` at any checkpoint. Returns a plain I/O error if the
    /// source can't be read.
    pub fn start(mut self) -> Result<UploadResult> {
        let n = self.params.n;
        let k = self.params.k;
        let happy = self.params.happy;
        info!(k, n, happy, num_segments = self.num_segments, "starting upload");

        let mut records: HashMap<u16, ShareholderRecord> =
            (0..n).map(|j| (j, ShareholderRecord::new(j))).collect();
        let mut plaintext_hashes = Vec::with_capacity(self.num_segments as usize);
        let mut crypttext_hashes = Vec::with_capacity(self.num_segments as usize);
        let mut block_hashes: Vec<Vec<Digest>> =
            (0..n).map(|_| Vec::with_capacity(self.num_segments as usize)).collect();

        for segno in 0..self.num_segments {
            let this_segment_len = segment_len(self.file_size, self.segment_size, segno);
            let mut segment_bytes = vec![0u8; this_segment_len];
            self.source.read_exact(&mut segment_bytes)?;

            let plaintext_hash = tagged_hash(tags::PLAINTEXT_LEAF, &segment_bytes);
            plaintext_hashes.push(plaintext_hash);

            let offset = u64::from(segno) * u64::from(self.segment_size);
            let crypttext_bytes = dispersal_crypto::encrypt(&self.key, offset, &segment_bytes);
            let crypttext_hash = tagged_hash(tags::CRYPTTEXT_LEAF, &crypttext_bytes);
            crypttext_hashes.push(crypttext_hash);

            let blocks = dispersal_fec::encode(&crypttext_bytes, k, n)?;
            for (j, block) in blocks.iter().enumerate() {
                let j = j as u16;
                block_hashes[j as usize].push(tagged_hash(tags::BLOCK_LEAF, block));
                let record = records.get_mut(&j).expect("record exists for every share index");
                if record.alive {
                    if let Some(w) = self.shareholders.get_mut(&j) {
                        match w.put_block(segno, block) {
                            Ok(()) => record.blocks_sent += 1,
                            Err(_) => record.mark_dead(),
                        }
                    }
                }
            }

            let live = live_count(&records);
            check_happiness(live, happy)?;
            debug!(segno, live, "segment committed");
        }

        let plaintext_tree = HashTree::build(&plaintext_hashes);
        let crypttext_tree = HashTree::build(&crypttext_hashes);
        let plaintext_root_hash = plaintext_tree.root().expect("built tree has a root");
        let crypttext_root_hash = crypttext_tree.root().expect("built tree has a root");

        let block_trees: Vec<HashTree> =
            block_hashes.iter().map(|leaves| HashTree::build(leaves)).collect();
        let share_leaves: Vec<Digest> = block_trees
            .iter()
            .map(|t| tagged_hash(tags::SHARE_LEAF, &t.root().expect("built tree has a root")))
            .collect();
        let share_tree = HashTree::build(&share_leaves);
        let share_root_hash = share_tree.root().expect("built tree has a root");

        for j in alive_indices(&records) {
            let w = match self.shareholders.get_mut(&j) {
                Some(w) => w,
                None => continue,
            };
            let ok = w.put_block_hashes(&block_trees[j as usize].all_nodes()).is_ok()
                && w.put_share_hashes(&share_tree.needed_hashes(j as usize)).is_ok()
                && w.put_plaintext_hashes(&plaintext_tree.all_nodes()).is_ok()
                && w.put_crypttext_hashes(&crypttext_tree.all_nodes()).is_ok();
            let record = records.get_mut(&j).expect("record exists for every share index");
            if ok {
                record.hashes_sent = true;
            } else {
                record.mark_dead();
            }
        }
        check_happiness(live_count(&records), happy)?;

        let uri_extension = UriExtensionBlock {
            size: self.file_size,
            segment_size: self.segment_size,
            num_segments: self.num_segments,
            needed_shares: k,
            total_shares: n,
            share_root_hash,
            plaintext_root_hash,
            crypttext_root_hash,
        };
        let uri_extension_bytes = dispersal_core::io::to_canonical_cbor(&uri_extension)?;
        let uri_extension_hash = tagged_hash(tags::URI_EXTENSION, &uri_extension_bytes);

        for j in alive_indices(&records) {
            let w = match self.shareholders.get_mut(&j) {
                Some(w) => w,
                None => continue,
            };
            let record = records.get_mut(&j).expect("record exists for every share index");
            if w.put_uri_extension(&uri_extension_bytes).is_ok() {
                record.uri_extension_sent = true;
                if w.close().is_ok() {
                    record.closed = true;
                } else {
                    record.mark_dead();
                }
            } else {
                record.mark_dead();
            }
        }
        let live = live_count(&records);
        check_happiness(live, happy)?;
        info!(live, "upload complete");

        Ok(UploadResult {
            uri_extension_hash,
            k,
            n,
            file_size: self.file_size,
        })
    }
}

fn segment_len(file_size: u64, segment_size: u32, segno: u32) -> usize {
    if file_size == 0 {
        return 0;
    }
    let start = u64::from(segno) * u64::from(segment_size);
    let remaining = file_size - start;
    remaining.min(u64::from(segment_size)) as usize
}

fn check_happiness(live: usize, happy: u16) -> Result<()> {
    if (live as u16) < happy {
        return Err(DisperseError::NotEnoughPeers {
            needed: happy,
            have: live as u16,
        }
        .into());
    }
    Ok(())
}

fn live_count(records: &HashMap<u16, ShareholderRecord>) -> usize {
    records.values().filter(|r| r.alive).count()
}

fn alive_indices(records: &HashMap<u16, ShareholderRecord>) -> Vec<u16> {
    let mut v: Vec<u16> = records.values().filter(|r| r.alive).map(|r| r.share_index).collect();
    v.sort_unstable();
    v
}
