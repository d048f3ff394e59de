// crates/dispersal-fec/src/lib.rs

//! A systematic `(k, n)` erasure code over fixed-size byte blocks.
//!
//! `encode` splits a segment into `k` equal-length sub-blocks (the last
//! zero-padded if needed) and emits them unchanged, followed by `n - k`
//! Reed-Solomon parity blocks. `decode` accepts any `k` of the `n` blocks,
//! identified by index, and reconstructs the padded segment before
//! truncating to the caller-supplied size. The systematic property means
//! data shards never need encoding/decoding work when all `k` of them
//! happen to be present.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]

use anyhow::{ensure, Context, Result};
use dispersal_core::DisperseError;
use reed_solomon_erasure::galois_8::ReedSolomon;

/// Split `segment` into `k` equal sub-blocks (zero-padding the last one)
/// and append `n - k` parity blocks, all the same length.
///
/// # Errors
/// Returns an error if `k == 0`, `n < k`, or the Reed-Solomon matrix for
/// `(k, n - k)` cannot be constructed.
pub fn encode(segment: &[u8], k: u16, n: u16) -> Result<Vec<Vec<u8>>> {
    let (k, n) = (k as usize, n as usize);
    ensure!(k > 0, "k must be positive");
    ensure!(n >= k, "n ({n}) must be >= k ({k})");
    let parity = n - k;
    let sub_len = sub_block_len(segment.len(), k);

    let mut shards = Vec::with_capacity(n);
    for i in 0..k {
        let start = i * sub_len;
        let end = (start + sub_len).min(segment.len());
        let mut shard = vec![0u8; sub_len];
        if start < segment.len() {
            shard[..end - start].copy_from_slice(&segment[start..end]);
        }
        shards.push(shard);
    }
    shards.resize(n, vec![0u8; sub_len]);

    if parity > 0 {
        let rs = ReedSolomon::new(k, parity).context("construct reed-solomon matrix")?;
        rs.encode(&mut shards).context("reed-solomon encode")?;
    }
    Ok(shards)
}

/// Reconstruct a segment from any `k` of its `n` indexed blocks, then
/// truncate the result to `segment_size`.
///
/// # Errors
/// Returns [`DisperseError::NotEnoughBlocks`] if fewer than `k` blocks are
/// supplied. Returns a plain error for malformed input (inconsistent block
/// lengths, out-of-range indices, or a reconstruction failure).
pub fn decode(
    blocks: &[(u16, Vec<u8>)],
    k: u16,
    n: u16,
    segment_size: usize,
) -> Result<Vec<u8>> {
    let (k, n) = (k as usize, n as usize);
    if blocks.len() < k {
        return Err(DisperseError::NotEnoughBlocks {
            needed: k as u16,
            got: blocks.len() as u16,
        }
        .into());
    }
    let sub_len = blocks[0].1.len();
    ensure!(
        blocks.iter().all(|(_, b)| b.len() == sub_len),
        "blocks have inconsistent lengths"
    );

    let mut shards: Vec<Option<Vec<u8>>> = vec![None; n];
    for (idx, data) in blocks {
        let idx = *idx as usize;
        ensure!(idx < n, "block index {idx} out of range for n={n}");
        shards[idx] = Some(data.clone());
    }

    let parity = n - k;
    if parity > 0 {
        let rs = ReedSolomon::new(k, parity).context("construct reed-solomon matrix")?;
        rs.reconstruct(&mut shards).context("reed-solomon reconstruct")?;
    } else {
        ensure!(
            shards.iter().all(Option::is_some),
            "no parity shards available to reconstruct a missing data shard"
        );
    }

    let mut padded = Vec::with_capacity(sub_len * k);
    for shard in shards.into_iter().take(k) {
        padded.extend_from_slice(&shard.expect("reconstruct fills every data shard"));
    }
    padded.truncate(segment_size);
    Ok(padded)
}

#[inline]
fn sub_block_len(total: usize, k: usize) -> usize {
    total.div_ceil(k).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip_with_exact_k_blocks() {
        let segment = b"the quick brown fox jumps over the lazy dog, twice over";
        let blocks = encode(segment, 4, 7).unwrap();
        assert_eq!(blocks.len(), 7);
        let lens: Vec<_> = blocks.iter().map(Vec::len).collect();
        assert!(lens.windows(2).all(|w| w[0] == w[1]));

        let subset: Vec<(u16, Vec<u8>)> = blocks
            .iter()
            .enumerate()
            .skip(1)
            .take(4)
            .map(|(i, b)| (i as u16, b.clone()))
            .collect();
        let decoded = decode(&subset, 4, 7, segment.len()).unwrap();
        assert_eq!(decoded, segment);
    }

    #[test]
    fn systematic_prefix_is_unchanged_plaintext() {
        let segment = b"0123456789abcdef";
        let blocks = encode(segment, 4, 6).unwrap();
        let sub_len = segment.len() / 4;
        for (i, block) in blocks.iter().take(4).enumerate() {
            assert_eq!(&block[..], &segment[i * sub_len..(i + 1) * sub_len]);
        }
    }

    #[test]
    fn decode_fails_with_too_few_blocks() {
        let segment = b"short segment";
        let blocks = encode(segment, 4, 8).unwrap();
        let subset: Vec<_> = blocks
            .into_iter()
            .enumerate()
            .take(3)
            .map(|(i, b)| (i as u16, b))
            .collect();
        let err = decode(&subset, 4, 8, segment.len()).unwrap_err();
        assert!(err.downcast_ref::<DisperseError>().is_some());
    }

    #[test]
    fn decode_is_order_independent_in_which_k_blocks_are_supplied() {
        let segment = b"deterministic reconstruction regardless of which k survive";
        let blocks = encode(segment, 5, 9).unwrap();

        let first_k: Vec<_> = blocks
            .iter()
            .enumerate()
            .take(5)
            .map(|(i, b)| (i as u16, b.clone()))
            .collect();
        let last_k: Vec<_> = blocks
            .iter()
            .enumerate()
            .skip(4)
            .map(|(i, b)| (i as u16, b.clone()))
            .collect();

        assert_eq!(
            decode(&first_k, 5, 9, segment.len()).unwrap(),
            decode(&last_k, 5, 9, segment.len()).unwrap()
        );
    }

    #[test]
    fn encode_is_deterministic() {
        let segment = b"deterministic across runs";
        assert_eq!(encode(segment, 3, 5).unwrap(), encode(segment, 3, 5).unwrap());
    }
}
