//! 128-bit SimHash fingerprints over character shingles.
//!
//! Cheap to compute, cheap to compare: near-duplicate detection reduces to
//! one XOR and a popcount per stored fingerprint.

use std::collections::HashSet;

/// Shingle width in characters.
const SHINGLE_LEN: usize = 5;

/// Hamming distance (out of 128) at or below which two fingerprints count
/// as near-duplicates. Empirically chosen.
pub const NEAR_DUPLICATE_DISTANCE: u32 = 15;

/// Compute the SimHash over the union of character 5-shingles of all input
/// strings.
///
/// Each shingle is hashed to 128 bits (MD5); a signed accumulator per bit
/// position is incremented on 1-bits and decremented on 0-bits; the output
/// bit is 1 iff the accumulator is ≥ 0.
pub fn simhash<S: AsRef<str>>(texts: &[S]) -> u128 {
    let mut shingles: HashSet<String> = HashSet::new();
    for text in texts {
        let chars: Vec<char> = text.as_ref().chars().collect();
        if chars.len() < SHINGLE_LEN {
            if !chars.is_empty() {
                shingles.insert(chars.iter().collect());
            }
            continue;
        }
        for window in chars.windows(SHINGLE_LEN) {
            shingles.insert(window.iter().collect());
        }
    }

    let mut acc = [0i32; 128];
    for shingle in &shingles {
        let digest = md5::compute(shingle.as_bytes());
        let hash = u128::from_be_bytes(digest.0);
        for (bit, slot) in acc.iter_mut().enumerate() {
            if (hash >> bit) & 1 == 1 {
                *slot += 1;
            } else {
                *slot -= 1;
            }
        }
    }

    let mut out = 0u128;
    for (bit, slot) in acc.iter().enumerate() {
        if *slot >= 0 {
            out |= 1 << bit;
        }
    }
    out
}

/// Number of differing bits between two fingerprints.
pub fn hamming_distance(a: u128, b: u128) -> u32 {
    (a ^ b).count_ones()
}

/// Near-duplicate test at the given Hamming threshold.
pub fn is_near_duplicate(a: u128, b: u128, max_distance: u32) -> bool {
    hamming_distance(a, b) <= max_distance
}
