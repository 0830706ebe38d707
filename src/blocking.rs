//! End-to-end blocking over pre-tokenized documents.
//!
//! [`Deduplicator`] wires the pieces together: token sets → signatures → bucket
//! index → candidate pairs → exact scores. Tokenization stays with the caller;
//! documents arrive as `(id, token set)` pairs.
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashSet;
//! use nearsketch::blocking::{Deduplicator, LshConfig};
//! use nearsketch::candidates::CandidatePair;
//! use nearsketch::compare::jaccard_similarity;
//!
//! let docs: Vec<(&str, HashSet<&str>)> = vec![
//!     ("a", "the cat sat on the mat".split_whitespace().collect()),
//!     ("b", "the cat sat on a mat".split_whitespace().collect()),
//!     ("c", "quantum chromodynamics lecture notes".split_whitespace().collect()),
//! ];
//!
//! let dedup = Deduplicator::new(LshConfig::default()).unwrap();
//! let report = dedup.run(&docs, jaccard_similarity).unwrap();
//! assert!(report.candidates.contains(&CandidatePair::new("a", "b")));
//! ```
//!
//! # Notes
//!
//! - Configuration is validated in [`Deduplicator::new`], before any hashing.
//! - Documents with empty token sets are skipped and listed in the report.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::candidates::{all_candidates, CandidatePair};
use crate::compare::compare_par;
use crate::lsh::{BucketIndex, Error, IndexShape, Result};
use crate::minhash::{HashFamily, Signature};
use crate::probability;

/// Configuration for MinHash + banding LSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LshConfig {
    /// Seed for the hash family. Batches that will be merged must share it.
    pub seed: u64,
    /// Signature length `n` (number of hash functions).
    pub num_hashes: usize,
    /// Number of bands `b`; must divide `num_hashes`.
    pub num_bands: usize,
    /// Documents per independently built partial index.
    pub batch_size: usize,
}

impl Default for LshConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_hashes: 128,
            num_bands: 32,
            batch_size: 1024,
        }
    }
}

impl LshConfig {
    /// Create config optimized for high recall (more candidates).
    pub fn high_recall() -> Self {
        Self {
            num_hashes: 100,
            num_bands: 50,
            ..Default::default()
        }
    }

    /// Create config optimized for high precision (fewer, better candidates).
    pub fn high_precision() -> Self {
        Self {
            num_hashes: 80,
            num_bands: 10,
            ..Default::default()
        }
    }

    /// Pick the band count whose S-curve knee is closest to `target`.
    pub fn for_threshold(num_hashes: usize, target: f64) -> Result<Self> {
        if target.is_nan() || target <= 0.0 || target > 1.0 {
            return Err(Error::Config("target threshold must be in (0, 1]"));
        }
        let num_bands = probability::bands_for_threshold(num_hashes, target)
            .ok_or(Error::Config("signature length must be >= 1"))?;
        Ok(Self {
            num_hashes,
            num_bands,
            ..Default::default()
        })
    }

    /// Fail fast on a shape the index would reject.
    pub fn validate(&self) -> Result<()> {
        self.shape()?;
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be >= 1"));
        }
        Ok(())
    }

    /// The validated index shape.
    pub fn shape(&self) -> Result<IndexShape> {
        IndexShape::new(self.num_hashes, self.num_bands)
    }

    /// Rows per band, or 0 when `num_bands` is 0.
    pub fn rows_per_band(&self) -> usize {
        self.num_hashes.checked_div(self.num_bands).unwrap_or(0)
    }

    /// Similarity at which a pair has about even odds of becoming a candidate.
    pub fn threshold(&self) -> f64 {
        probability::threshold(self.num_hashes, self.num_bands)
    }

    /// Estimate the probability that two items with given Jaccard similarity
    /// will be placed in the same bucket (i.e., become candidates).
    ///
    /// \(P(\text{candidate}) = 1 - (1 - s^r)^b\)
    pub fn candidate_probability(&self, jaccard_similarity: f64) -> f64 {
        probability::probability(self.num_hashes, self.num_bands, jaccard_similarity)
    }
}

/// Everything a [`Deduplicator::run`] produced.
#[derive(Debug, Clone)]
pub struct DedupReport<Id> {
    /// Bucket index over all non-empty documents.
    pub index: BucketIndex<Id>,
    /// Pairs sharing at least one bucket.
    pub candidates: BTreeSet<CandidatePair<Id>>,
    /// Exact similarity for each candidate pair.
    pub scores: HashMap<CandidatePair<Id>, f64>,
    /// Documents skipped because their token set was empty.
    pub skipped: Vec<Id>,
}

impl<Id: Ord> DedupReport<Id> {
    /// Scored pairs at or above `min_score`, best first.
    pub fn duplicates(&self, min_score: f64) -> Vec<(&CandidatePair<Id>, f64)> {
        let mut out: Vec<(&CandidatePair<Id>, f64)> = self
            .scores
            .iter()
            .filter(|(_, &score)| score >= min_score)
            .map(|(pair, &score)| (pair, score))
            .collect();
        out.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        out
    }
}

/// MinHash + banding LSH over token sets.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    config: LshConfig,
    shape: IndexShape,
    family: HashFamily,
}

impl Deduplicator {
    /// Validate `config` and generate the hash family.
    pub fn new(config: LshConfig) -> Result<Self> {
        config.validate()?;
        let shape = config.shape()?;
        let family = HashFamily::generate(config.seed, config.num_hashes)?;
        debug!(
            seed = config.seed,
            num_hashes = config.num_hashes,
            num_bands = config.num_bands,
            threshold = config.threshold(),
            "configured deduplicator"
        );
        Ok(Self {
            config,
            shape,
            family,
        })
    }

    /// The configuration in use.
    pub fn config(&self) -> &LshConfig {
        &self.config
    }

    /// The hash family in use.
    pub fn family(&self) -> &HashFamily {
        &self.family
    }

    /// Signatures for every non-empty document, plus the ids that were skipped.
    pub fn signatures<Id, T>(
        &self,
        docs: &[(Id, HashSet<T>)],
    ) -> Result<(Vec<(Id, Signature)>, Vec<Id>)>
    where
        Id: Clone + Send + Sync,
        T: Hash + Sync,
    {
        let mut signatures = Vec::with_capacity(docs.len());
        let mut skipped = Vec::new();
        for (id, result) in self.family.compute_signatures_par(docs) {
            match result {
                Ok(sig) => signatures.push((id, sig)),
                Err(Error::EmptyInput) => skipped.push(id),
                Err(e) => return Err(e),
            }
        }
        if !skipped.is_empty() {
            warn!(
                num_skipped = skipped.len(),
                "skipped documents with empty token sets"
            );
        }
        Ok((signatures, skipped))
    }

    /// Bucket index over all non-empty documents, built batch-wise in parallel.
    ///
    /// Ids must be unique within `docs`; a repeat fails with
    /// [`Error::DuplicateDocument`] before anything is hashed.
    pub fn index<Id, T>(
        &self,
        docs: &[(Id, HashSet<T>)],
    ) -> Result<(BucketIndex<Id>, Vec<Id>)>
    where
        Id: Clone + Eq + Hash + Ord + Debug + Send + Sync,
        T: Hash + Sync,
    {
        let mut seen = HashSet::with_capacity(docs.len());
        if let Some((id, _)) = docs.iter().find(|(id, _)| !seen.insert(id)) {
            return Err(Error::DuplicateDocument(format!("{id:?}")));
        }
        let (signatures, skipped) = self.signatures(docs)?;
        let index =
            BucketIndex::build_par_with_shape(self.shape, &signatures, self.config.batch_size)?;
        Ok((index, skipped))
    }

    /// Candidate pairs over `docs`, without scoring them.
    pub fn candidates<Id, T>(
        &self,
        docs: &[(Id, HashSet<T>)],
    ) -> Result<(BTreeSet<CandidatePair<Id>>, Vec<Id>)>
    where
        Id: Clone + Eq + Hash + Ord + Debug + Send + Sync,
        T: Hash + Sync,
    {
        let (index, skipped) = self.index(docs)?;
        Ok((all_candidates(&index), skipped))
    }

    /// Index `docs`, extract candidates and score them with `similarity`.
    ///
    /// `similarity` is only called on candidate pairs. Ids must be unique
    /// within `docs` (see [`Deduplicator::index`]).
    pub fn run<Id, T, F>(
        &self,
        docs: &[(Id, HashSet<T>)],
        similarity: F,
    ) -> Result<DedupReport<Id>>
    where
        Id: Clone + Eq + Hash + Ord + Debug + Send + Sync,
        T: Hash + Sync,
        F: Fn(&HashSet<T>, &HashSet<T>) -> f64 + Sync,
    {
        let (index, skipped) = self.index(docs)?;
        let candidates = all_candidates(&index);

        let lookup: HashMap<Id, &HashSet<T>> =
            docs.iter().map(|(id, tokens)| (id.clone(), tokens)).collect();
        let scores = compare_par(
            &candidates,
            |id: &Id| lookup.get(id).copied(),
            |a: &&HashSet<T>, b: &&HashSet<T>| similarity(a, b),
        )?;

        debug!(
            num_docs = docs.len(),
            num_candidates = candidates.len(),
            num_skipped = skipped.len(),
            "deduplication run finished"
        );
        Ok(DedupReport {
            index,
            candidates,
            scores,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::jaccard_similarity;

    fn words(text: &'static str) -> HashSet<&'static str> {
        text.split_whitespace().collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = LshConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.rows_per_band(), 4);
        assert!(LshConfig::high_recall().threshold() < LshConfig::high_precision().threshold());
    }

    #[test]
    fn invalid_config_fails_at_setup() {
        let cfg = LshConfig {
            num_hashes: 100,
            num_bands: 30,
            ..Default::default()
        };
        assert_eq!(
            Deduplicator::new(cfg).unwrap_err(),
            Error::Indivisible {
                num_hashes: 100,
                num_bands: 30
            }
        );
        let cfg = LshConfig {
            num_bands: 0,
            ..Default::default()
        };
        assert_eq!(cfg.rows_per_band(), 0);
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
        let cfg = LshConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(Deduplicator::new(cfg).is_err());
    }

    #[test]
    fn config_from_partial_json() {
        let cfg: LshConfig =
            serde_json::from_str(r#"{"num_hashes": 240, "num_bands": 80}"#).unwrap();
        assert_eq!(cfg.num_hashes, 240);
        assert_eq!(cfg.seed, 42);
        assert!((cfg.threshold() - 0.232).abs() < 1e-3);
        assert!((cfg.candidate_probability(0.25) - 0.716).abs() < 1e-3);
    }

    #[test]
    fn for_threshold_picks_divisor() {
        let cfg = LshConfig::for_threshold(240, 0.232).unwrap();
        assert_eq!(cfg.num_bands, 80);
        assert!(LshConfig::for_threshold(0, 0.5).is_err());
        assert!(LshConfig::for_threshold(128, 1.5).is_err());
    }

    #[test]
    fn run_reports_near_duplicates_and_skips_empty_docs() {
        let docs = vec![
            ("1", words("barack obama was the president")),
            ("2", words("barack obama was a president")),
            ("3", words("zebra quokka narwhal axolotl")),
            ("4", HashSet::new()),
        ];
        let dedup = Deduplicator::new(LshConfig::high_recall()).unwrap();
        let report = dedup.run(&docs, jaccard_similarity).unwrap();

        assert_eq!(report.skipped, vec!["4"]);
        assert_eq!(report.index.num_documents(), 3);
        assert!(report.candidates.contains(&CandidatePair::new("1", "2")));
        assert_eq!(report.scores.len(), report.candidates.len());

        let dups = report.duplicates(0.5);
        assert_eq!(dups[0].0, &CandidatePair::new("1", "2"));
        assert!((dups[0].1 - 4.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn identical_documents_are_always_candidates() {
        let docs = vec![
            ("a".to_string(), words("New York")),
            ("b".to_string(), words("New York")),
        ];
        let dedup = Deduplicator::new(LshConfig::high_precision()).unwrap();
        let (index, skipped) = dedup.index(&docs).unwrap();
        assert!(skipped.is_empty());
        assert_eq!(index.num_collision_buckets(), 10);
    }

    #[test]
    fn candidates_skip_empty_documents() {
        let docs = vec![
            (1u32, words("New York")),
            (2, words("New York")),
            (3, HashSet::new()),
        ];
        let dedup = Deduplicator::new(LshConfig::high_precision()).unwrap();
        let (candidates, skipped) = dedup.candidates(&docs).unwrap();
        assert_eq!(candidates, BTreeSet::from([CandidatePair::new(1, 2)]));
        assert_eq!(skipped, vec![3]);
    }

    #[test]
    fn repeated_id_is_rejected_before_scoring() {
        let docs = vec![
            ("a", words("the cat sat")),
            ("b", words("the cat sat down")),
            ("a", words("something else entirely")),
        ];
        let dedup = Deduplicator::new(LshConfig::default()).unwrap();
        let err = dedup.run(&docs, jaccard_similarity).unwrap_err();
        assert_eq!(err, Error::DuplicateDocument("\"a\"".to_string()));
        assert!(dedup.candidates(&docs).is_err());
    }
}
