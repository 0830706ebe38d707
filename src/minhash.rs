//! MinHash signatures for Jaccard similarity estimation.
//!
//! A [`HashFamily`] holds `n` seed-derived hash functions. The signature of a token
//! set is the vector of per-function minimum hash values; two signatures agree at a
//! position with probability equal to the Jaccard similarity
//! \(J(A,B) = |A ∩ B| / |A ∪ B|\) of the underlying sets.
//!
//! Function `i` is `mix(base(token) ^ mask[i])`, where `base` is a stable FNV-1a
//! hash and the masks are drawn in index order from a ChaCha20 stream seeded once.
//! Both are platform independent, so equal `(seed, n)` yield bit-identical
//! signatures on every run and every machine. That is what makes independently
//! computed batches safe to merge.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::lsh::{Error, Result};

/// A small stable 64-bit FNV-1a hasher.
///
/// This avoids relying on `std`'s `DefaultHasher` stability guarantees.
/// Integers are fed as little-endian bytes and `usize`/`isize` (including the
/// length prefix of slices and strings) are widened to 64 bits, so a token
/// hashes to the same value on every target.
pub(crate) struct Fnv1a64 {
    state: u64,
}

impl Fnv1a64 {
    pub(crate) fn new() -> Self {
        // FNV offset basis
        Self {
            state: 0xcbf29ce484222325,
        }
    }
}

impl Hasher for Fnv1a64 {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        const PRIME: u64 = 0x00000100000001B3;
        for &b in bytes {
            self.state ^= b as u64;
            self.state = self.state.wrapping_mul(PRIME);
        }
    }

    fn write_u16(&mut self, i: u16) {
        self.write(&i.to_le_bytes());
    }

    fn write_u32(&mut self, i: u32) {
        self.write(&i.to_le_bytes());
    }

    fn write_u64(&mut self, i: u64) {
        self.write(&i.to_le_bytes());
    }

    fn write_u128(&mut self, i: u128) {
        self.write(&i.to_le_bytes());
    }

    fn write_usize(&mut self, i: usize) {
        self.write_u64(i as u64);
    }

    fn write_i16(&mut self, i: i16) {
        self.write_u16(i as u16);
    }

    fn write_i32(&mut self, i: i32) {
        self.write_u32(i as u32);
    }

    fn write_i64(&mut self, i: i64) {
        self.write_u64(i as u64);
    }

    fn write_i128(&mut self, i: i128) {
        self.write_u128(i as u128);
    }

    // sign-extend, so -1isize is eight 0xff bytes on 32-bit targets too
    fn write_isize(&mut self, i: isize) {
        self.write_i64(i as i64);
    }
}

/// SplitMix64 finalizer.
#[inline]
pub(crate) fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

/// A deterministic family of `n` min-wise hash functions.
///
/// Immutable after [`HashFamily::generate`]. Two families are interchangeable
/// exactly when they were generated from the same seed and length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashFamily {
    seed: u64,
    masks: Vec<u64>,
}

impl HashFamily {
    /// Generate `n` hash functions from `seed`.
    ///
    /// Fails with a configuration error when `n == 0`.
    pub fn generate(seed: u64, n: usize) -> Result<Self> {
        if n == 0 {
            return Err(Error::Config("signature length must be >= 1"));
        }
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let masks: Vec<u64> = (0..n).map(|_| rng.next_u64()).collect();
        debug!(seed, num_hashes = n, "generated hash family");
        Ok(Self { seed, masks })
    }

    /// Seed the family was generated from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of hash functions (signature length).
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    /// Always false: a family has at least one function.
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    /// Compute the signature of a token set.
    ///
    /// Duplicate tokens are harmless (the minimum is idempotent), so any iterable
    /// works; a `HashSet` is the usual input. Returns [`Error::EmptyInput`] when
    /// there are no tokens.
    pub fn compute_signature<T, I>(&self, tokens: I) -> Result<Signature>
    where
        T: Hash,
        I: IntoIterator<Item = T>,
    {
        let mut mins = vec![u64::MAX; self.masks.len()];
        let mut seen_any = false;
        for token in tokens {
            seen_any = true;
            let base = base_hash(&token);
            for (min, &mask) in mins.iter_mut().zip(&self.masks) {
                let h = mix64(base ^ mask);
                if h < *min {
                    *min = h;
                }
            }
        }
        if !seen_any {
            return Err(Error::EmptyInput);
        }
        Ok(Signature { values: mins })
    }

    /// Compute signatures for a batch of documents in parallel.
    ///
    /// Output order follows input order. An empty document yields `Err` in its
    /// slot without affecting the rest of the batch.
    pub fn compute_signatures_par<Id, T>(
        &self,
        docs: &[(Id, HashSet<T>)],
    ) -> Vec<(Id, Result<Signature>)>
    where
        Id: Clone + Send + Sync,
        T: Hash + Sync,
    {
        let out: Vec<(Id, Result<Signature>)> = docs
            .par_iter()
            .map(|(id, tokens)| (id.clone(), self.compute_signature(tokens)))
            .collect();
        debug!(
            num_docs = docs.len(),
            num_hashes = self.len(),
            "computed signature batch"
        );
        out
    }
}

/// Compute the signature of `tokens` under `family`.
///
/// Free-function form of [`HashFamily::compute_signature`].
pub fn compute_signature<T, I>(tokens: I, family: &HashFamily) -> Result<Signature>
where
    T: Hash,
    I: IntoIterator<Item = T>,
{
    family.compute_signature(tokens)
}

fn base_hash<T: Hash>(token: &T) -> u64 {
    let mut hasher = Fnv1a64::new();
    token.hash(&mut hasher);
    hasher.finish()
}

/// A MinHash signature (fingerprint) of a token set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    /// The min-hash values, one per hash function.
    pub values: Vec<u64>,
}

impl Signature {
    /// Signature length.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the signature has no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Estimate Jaccard similarity from two signatures.
    pub fn jaccard(&self, other: &Self) -> f64 {
        if self.values.len() != other.values.len() || self.values.is_empty() {
            return 0.0;
        }
        let matches = self
            .values
            .iter()
            .zip(other.values.iter())
            .filter(|(a, b)| a == b)
            .count();
        matches as f64 / self.values.len() as f64
    }

    /// Hamming distance between signatures (positions where values differ).
    pub fn hamming_distance(&self, other: &Self) -> usize {
        self.values
            .iter()
            .zip(other.values.iter())
            .filter(|(a, b)| a != b)
            .count()
    }
}
