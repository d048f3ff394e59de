//! Cross-module invariants for capability encoding and canonical CBOR.
//!
//! These treat the textual capability form and the canonical CBOR codec as
//! the two serialization boundaries the rest of the workspace trusts to be
//! lossless, and fuzz them with structurally-valid-but-arbitrary inputs
//! rather than a handful of fixed examples.

use dispersal_core::capability::{Capability, MAX_KEY_LEN, MIN_KEY_LEN};
use dispersal_core::io::{from_cbor, to_canonical_cbor};
use dispersal_core::types::UriExtensionBlock;
use proptest::prelude::*;

prop_compose! {
    fn arb_key()(len in MIN_KEY_LEN..=MAX_KEY_LEN, seed in any::<u64>()) -> Vec<u8> {
        let mut key = vec![0u8; len];
        for (i, b) in key.iter_mut().enumerate() {
            *b = seed.wrapping_add(i as u64) as u8;
        }
        key
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn capability_text_roundtrips(
        key in arb_key(),
        uext in any::<[u8; 32]>(),
        k in 1u16..=500,
        extra in 0u16..=500,
        size in any::<u64>(),
    ) {
        let n = k + extra;
        let cap = Capability::new(key, uext, k, n, size).unwrap();
        let text = cap.to_uri_string();
        let back = Capability::from_uri_string(&text).unwrap();
        prop_assert_eq!(cap, back);
    }

    #[test]
    fn capability_rejects_k_above_n(n in 1u16..=500, over in 1u16..=500) {
        let k = n + over;
        let key = vec![0u8; MIN_KEY_LEN];
        prop_assert!(Capability::new(key, [0u8; 32], k, n, 0).is_err());
    }

    #[test]
    fn uri_extension_block_cbor_roundtrips(
        size in any::<u64>(),
        num_segments in 1u32..=10_000,
        segment_size in 1u32..=(1u32 << 20),
        k in 1u16..=250,
        extra in 0u16..=250,
        crypttext_root_hash in any::<[u8; 32]>(),
        plaintext_root_hash in any::<[u8; 32]>(),
        share_root_hash in any::<[u8; 32]>(),
    ) {
        let n = k + extra;
        let block = UriExtensionBlock {
            size,
            segment_size,
            num_segments,
            needed_shares: k,
            total_shares: n,
            share_root_hash,
            plaintext_root_hash,
            crypttext_root_hash,
        };
        let bytes = to_canonical_cbor(&block).unwrap();
        let back: UriExtensionBlock = from_cbor(&bytes).unwrap();
        prop_assert_eq!(block, back);
    }
}
