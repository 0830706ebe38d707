//! `nearsketch`: near-duplicate detection with MinHash and banding LSH.
//!
//! Documents come in as token sets; each is reduced to a fixed-length MinHash
//! signature whose agreement rate estimates Jaccard similarity. Signatures are cut
//! into bands and bucketed, so only documents that agree on a whole band are
//! compared exactly. The full pairwise comparison is never performed.
//!
//! - [`minhash`]: seeded hash family and signatures
//! - [`lsh`]: the mergeable bucket index and its row relation
//! - [`candidates`]: per-document queries and the deduplicated candidate set
//! - [`probability`]: the S-curve used to choose signature length and band count
//! - [`compare`]: exact scoring restricted to candidate pairs
//! - [`blocking`]: configuration and the end-to-end driver
//!
//! Scope here is *primitives*: tokenization, storage and the choice of similarity
//! function belong to the caller.

#![warn(missing_docs)]

pub mod blocking;
pub mod candidates;
pub mod compare;
pub mod lsh;
pub mod minhash;
pub mod probability;

pub use blocking::{DedupReport, Deduplicator, LshConfig};
pub use candidates::{all_candidates, query, query_signature, CandidatePair};
pub use compare::{compare, compare_par, jaccard_similarity};
pub use lsh::{BucketIndex, BucketKey, BucketRow, Error, IndexShape, Result};
pub use minhash::{compute_signature, HashFamily, Signature};
pub use probability::{probability, threshold};
