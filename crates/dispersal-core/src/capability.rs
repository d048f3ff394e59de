// crates/dispersal-core/src/capability.rs

//! The capability (URI) that names an immutable file (§3, §6).
//!
//! A capability carries everything needed to address and validate a file
//! without granting read access to anyone lacking the key: the symmetric
//! key, the URI-extension hash, `(k, n)`, and the plaintext size.
//!
//! The textual form is self-delimiting and stable: `URI:CHK:<key>:<uext>:k:n:size`
//! where `<key>` and `<uext>` are lowercase base32 (RFC4648, no padding),
//! matching the pack's convention of using the `base32` crate for compact,
//! self-delimiting tokens.

use crate::types::Digest;
use anyhow::{anyhow, Context, Result};

/// Symmetric key length bounds per §3 (16–32 bytes).
pub const MIN_KEY_LEN: usize = 16;
/// Symmetric key length bounds per §3 (16–32 bytes).
pub const MAX_KEY_LEN: usize = 32;

const URI_PREFIX: &str = "URI:CHK:";

/// A capability: the complete, self-contained handle for one immutable file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capability {
    /// Opaque symmetric key (16–32 bytes).
    pub key: Vec<u8>,
    /// Hash of the canonical URI-extension block.
    pub uri_extension_hash: Digest,
    /// Shares needed to reconstruct (`k`).
    pub needed_shares: u16,
    /// Total shares produced (`n`).
    pub total_shares: u16,
    /// Plaintext file size in bytes.
    pub size: u64,
}

impl Capability {
    /// Construct a capability, validating the key length invariant.
    ///
    /// # Errors
    /// Returns an error if `key.len()` is outside `[MIN_KEY_LEN, MAX_KEY_LEN]`
    /// or if `needed_shares > total_shares`.
    pub fn new(
        key: Vec<u8>,
        uri_extension_hash: Digest,
        needed_shares: u16,
        total_shares: u16,
        size: u64,
    ) -> Result<Self> {
        if key.len() < MIN_KEY_LEN || key.len() > MAX_KEY_LEN {
            return Err(anyhow!(
                "key length {} out of range [{}, {}]",
                key.len(),
                MIN_KEY_LEN,
                MAX_KEY_LEN
            ));
        }
        if needed_shares == 0 || needed_shares > total_shares {
            return Err(anyhow!(
                "needed_shares ({needed_shares}) must be in 1..=total_shares ({total_shares})"
            ));
        }
        Ok(Self {
            key,
            uri_extension_hash,
            needed_shares,
            total_shares,
            size,
        })
    }

    /// Render the stable textual form.
    #[must_use]
    pub fn to_uri_string(&self) -> String {
        format!(
            "{URI_PREFIX}{}:{}:{}:{}:{}",
            encode_b32(&self.key),
            encode_b32(&self.uri_extension_hash),
            self.needed_shares,
            self.total_shares,
            self.size
        )
    }

    /// Parse the stable textual form produced by [`Self::to_uri_string`].
    ///
    /// # Errors
    /// Returns an error if the prefix, field count, base32 payloads, or
    /// numeric fields are malformed.
    pub fn from_uri_string(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(URI_PREFIX)
            .ok_or_else(|| anyhow!("missing {URI_PREFIX} prefix"))?;
        let mut parts = rest.split(':');
        let key_b32 = parts.next().ok_or_else(|| anyhow!("missing key field"))?;
        let uext_b32 = parts
            .next()
            .ok_or_else(|| anyhow!("missing uri_extension_hash field"))?;
        let k_str = parts.next().ok_or_else(|| anyhow!("missing k field"))?;
        let n_str = parts.next().ok_or_else(|| anyhow!("missing n field"))?;
        let size_str = parts.next().ok_or_else(|| anyhow!("missing size field"))?;
        if parts.next().is_some() {
            return Err(anyhow!("trailing fields in capability string"));
        }

        let key = decode_b32(key_b32).context("decoding key")?;
        let uext = decode_b32(uext_b32).context("decoding uri_extension_hash")?;
        let uri_extension_hash: Digest = uext
            .try_into()
            .map_err(|v: Vec<u8>| anyhow!("uri_extension_hash must be 32 bytes, got {}", v.len()))?;
        let needed_shares: u16 = k_str.parse().context("parsing k")?;
        let total_shares: u16 = n_str.parse().context("parsing n")?;
        let size: u64 = size_str.parse().context("parsing size")?;

        Self::new(key, uri_extension_hash, needed_shares, total_shares, size)
    }
}

fn encode_b32(bytes: &[u8]) -> String {
    base32::encode(base32::Alphabet::Rfc4648 { padding: false }, bytes).to_ascii_lowercase()
}

fn decode_b32(s: &str) -> Result<Vec<u8>> {
    base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &s.to_ascii_uppercase())
        .ok_or_else(|| anyhow!("invalid base32 payload"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Capability {
        Capability::new(vec![7u8; 16], [9u8; 32], 25, 100, 12345).unwrap()
    }

    #[test]
    fn roundtrips_through_text() {
        let cap = sample();
        let s = cap.to_uri_string();
        assert!(s.starts_with(URI_PREFIX));
        let back = Capability::from_uri_string(&s).unwrap();
        assert_eq!(cap, back);
    }

    #[test]
    fn rejects_bad_key_length() {
        assert!(Capability::new(vec![0u8; 8], [0u8; 32], 1, 1, 0).is_err());
        assert!(Capability::new(vec![0u8; 40], [0u8; 32], 1, 1, 0).is_err());
    }

    #[test]
    fn rejects_k_greater_than_n() {
        assert!(Capability::new(vec![0u8; 16], [0u8; 32], 5, 4, 0).is_err());
    }

    #[test]
    fn rejects_malformed_text() {
        assert!(Capability::from_uri_string("not a capability").is_err());
        assert!(Capability::from_uri_string("URI:CHK:onlykey").is_err());
    }
}
