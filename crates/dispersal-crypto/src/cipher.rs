// crates/dispersal-crypto/src/cipher.rs

//! An offset-addressable keystream cipher built on BLAKE3's keyed XOF.
//!
//! Plaintext is divided into segments before it ever reaches this module
//! (§4), and each segment is encrypted independently, addressed by its byte
//! offset in the plaintext. We derive the keystream for a given offset by
//! absorbing the offset into a keyed BLAKE3 state before squeezing, so the
//! same `(key, offset)` pair always yields the same keystream prefix —
//! generalizing the `Blake3Transcript` absorb-then-challenge pattern from a
//! transcript to a raw keystream.

use crate::{tagged_hash, tags};
use std::io::Read;

/// Derive the keystream bytes for `key` at `offset`, `len` bytes long.
///
/// `key` may be any length (the caller's raw symmetric key, 16-32 bytes per
/// the capability format); it is first folded down to a 32-byte BLAKE3 key
/// via [`tagged_hash`] under [`tags::CIPHER_SUBKEY`].
#[must_use]
pub fn keystream(key: &[u8], offset: u64, len: usize) -> Vec<u8> {
    let subkey = tagged_hash(tags::CIPHER_SUBKEY, key);
    let mut hasher = blake3::Hasher::new_keyed(&subkey);
    hasher.update(&offset.to_le_bytes());
    let mut xof = hasher.finalize_xof();
    let mut out = vec![0u8; len];
    xof.read_exact(&mut out)
        .expect("blake3 XOF read_exact is infallible for any requested length");
    out
}

/// Encrypt `plaintext` starting at byte `offset`, XOR-ing against the
/// keystream for `(key, offset)`.
#[must_use]
pub fn encrypt(key: &[u8], offset: u64, plaintext: &[u8]) -> Vec<u8> {
    xor_with_keystream(key, offset, plaintext)
}

/// Decrypt `crypttext` starting at byte `offset`. Identical to [`encrypt`]
/// since XOR is its own inverse; kept as a separate name for call-site
/// clarity (upload vs. download paths).
#[must_use]
pub fn decrypt(key: &[u8], offset: u64, crypttext: &[u8]) -> Vec<u8> {
    xor_with_keystream(key, offset, crypttext)
}

fn xor_with_keystream(key: &[u8], offset: u64, data: &[u8]) -> Vec<u8> {
    let ks = keystream(key, offset, data.len());
    data.iter().zip(ks.iter()).map(|(a, b)| a ^ b).collect()
}
