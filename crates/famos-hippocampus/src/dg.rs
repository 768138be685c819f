//! DG pattern separation: shingling, SimHash, MinHash.

use serde::{Deserialize, Serialize};

/// Fixed SimHash width in bits.
pub const SIMHASH_BITS: usize = 512;

const WORDS: usize = SIMHASH_BITS / 64;

/// Character shingle length.
const SHINGLE_LEN: usize = 3;

/// 512-bit sparse distributed representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimHash(pub [u64; WORDS]);

impl SimHash {
    /// Hamming distance to another code.
    pub fn hamming(&self, other: &SimHash) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }

    /// Normalized Hamming distance in `[0, 1]`.
    pub fn hamming_norm(&self, other: &SimHash) -> f64 {
        self.hamming(other) as f64 / SIMHASH_BITS as f64
    }
}

/// DG output: SimHash plus MinHash sketch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseCode {
    /// 512-bit SimHash.
    pub simhash: SimHash,
    /// K-permutation MinHash sketch.
    pub minhash: Vec<u32>,
}

/// Estimated Jaccard similarity from two MinHash sketches.
pub fn jaccard_estimate(a: &[u32], b: &[u32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let equal = a.iter().zip(b.iter()).filter(|(x, y)| x == y).count();
    equal as f64 / a.len() as f64
}

/// Splitmix64 finalizer; cheap, deterministic, and well distributed.
fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

/// Seeded hash of a shingle.
fn hash_shingle(seed: u64, shingle: &[u8]) -> u64 {
    let mut h = mix64(seed ^ 0x51_7c_c1_b7_27_22_0a_95);
    for &byte in shingle {
        h = mix64(h ^ byte as u64);
    }
    h
}

/// The DG encoder. Stateless; configuration is the sketch width.
#[derive(Debug, Clone)]
pub struct DgEncoder {
    minhash_k: usize,
}

impl DgEncoder {
    /// Encoder with `minhash_k` permutations.
    pub fn new(minhash_k: usize) -> Self {
        Self { minhash_k }
    }

    /// Lowercased character shingles of the content.
    ///
    /// Whitespace runs collapse to a single space first so formatting
    /// differences do not separate otherwise-identical content.
    pub fn shingles(text: &str) -> Vec<Vec<u8>> {
        let normalized: String = text
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let chars: Vec<char> = normalized.chars().collect();
        if chars.len() < SHINGLE_LEN {
            if chars.is_empty() {
                return Vec::new();
            }
            return vec![normalized.into_bytes()];
        }
        chars
            .windows(SHINGLE_LEN)
            .map(|w| w.iter().collect::<String>().into_bytes())
            .collect()
    }

    /// Encode content into a sparse code.
    pub fn encode(&self, text: &str) -> SparseCode {
        let shingles = Self::shingles(text);

        // SimHash: per-bit weighted vote across all shingles.
        let mut acc = [0i32; SIMHASH_BITS];
        for shingle in &shingles {
            // Eight 64-bit lanes give the full 512 bit positions.
            for word in 0..WORDS {
                let bits = hash_shingle(word as u64, shingle);
                for bit in 0..64 {
                    let idx = word * 64 + bit;
                    if (bits >> bit) & 1 == 1 {
                        acc[idx] += 1;
                    } else {
                        acc[idx] -= 1;
                    }
                }
            }
        }
        let mut words = [0u64; WORDS];
        for (idx, &vote) in acc.iter().enumerate() {
            if vote >= 0 {
                words[idx / 64] |= 1 << (idx % 64);
            }
        }

        // MinHash: minimum of the seeded hash per permutation.
        let mut minhash = vec![u32::MAX; self.minhash_k];
        for shingle in &shingles {
            for (perm, slot) in minhash.iter_mut().enumerate() {
                let h = hash_shingle(0x1000 + perm as u64, shingle) as u32;
                if h < *slot {
                    *slot = h;
                }
            }
        }

        SparseCode {
            simhash: SimHash(words),
            minhash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder() -> DgEncoder {
        DgEncoder::new(64)
    }

    #[test]
    fn identical_text_gives_identical_codes() {
        let a = encoder().encode("Morning note about school pickup");
        let b = encoder().encode("Morning note about school pickup");
        assert_eq!(a, b);
        assert_eq!(a.simhash.hamming(&b.simhash), 0);
        assert_eq!(jaccard_estimate(&a.minhash, &b.minhash), 1.0);
    }

    #[test]
    fn case_and_spacing_are_normalized_away() {
        let a = encoder().encode("Dinner   Plan\ttonight");
        let b = encoder().encode("dinner plan tonight");
        assert_eq!(a, b);
    }

    #[test]
    fn appended_sentence_stays_a_near_duplicate() {
        let base = "Grocery run after work, remember milk eggs and the bread Sofia likes. \
                    Pharmacy closes at seven so go there first.";
        let extended = format!("{base} Also pick up the dry cleaning.");
        let a = encoder().encode(base);
        let b = encoder().encode(&extended);
        assert!(
            a.simhash.hamming_norm(&b.simhash) <= 0.15,
            "normalized hamming {} too large",
            a.simhash.hamming_norm(&b.simhash)
        );
    }

    #[test]
    fn unrelated_texts_are_far_apart() {
        let a = encoder().encode("Morning note about school pickup");
        let b = encoder().encode("Quarterly tax filing deadline is approaching fast");
        assert!(a.simhash.hamming_norm(&b.simhash) > 0.25);
        assert!(jaccard_estimate(&a.minhash, &b.minhash) < 0.3);
    }

    #[test]
    fn empty_text_yields_a_stable_code() {
        let a = encoder().encode("");
        let b = encoder().encode("");
        assert_eq!(a, b);
        assert_eq!(a.minhash.len(), 64);
    }
}
