//! Shared test fixtures, gated behind the `test-support` feature so the
//! hashtree, encoder, and downloader test suites can depend on this crate
//! with `features = ["test-support"]` in `[dev-dependencies]` rather than
//! each re-implementing the same corruption helper.

/// Flip the least-significant bit of the last byte, the smallest possible
/// corruption that still changes every hash over the buffer.
///
/// Panics on an empty slice — there is no last byte to flip.
#[must_use]
pub fn flip_bit(mut bytes: Vec<u8>) -> Vec<u8> {
    let last = bytes.last_mut().expect("flip_bit requires a non-empty buffer");
    *last ^= 0x01;
    bytes
}
