//! Banding LSH over MinHash signatures.
//!
//! A signature of length `n` is cut into `b` bands of `r = n / b` rows. Each band
//! is hashed, together with its band index, to a [`BucketKey`]; documents that
//! share a key agree on that whole band and land in the same bucket.
//!
//! A [`BucketIndex`] only grows. Independently built indices with the same shape
//! combine by per-key set union ([`BucketIndex::merge`]), which is associative and
//! commutative, so batches can be reduced in any order. The index is also exposed
//! as a flat relation of [`BucketRow`]s that can be concatenated across batches and
//! regrouped with [`BucketIndex::from_rows`].

use std::borrow::Borrow;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::minhash::{Fnv1a64, Signature};

/// Errors for signature generation, indexing and comparison.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A parameter is out of range.
    #[error("invalid parameter: {0}")]
    Config(&'static str),
    /// Signature length is not a multiple of the band count.
    #[error("signature length {num_hashes} is not divisible by {num_bands} bands")]
    Indivisible {
        /// Signature length `n`.
        num_hashes: usize,
        /// Band count `b`.
        num_bands: usize,
    },
    /// A signature was requested for an empty token set.
    #[error("cannot compute a signature for an empty token set")]
    EmptyInput,
    /// A signature does not have the length the index was built for.
    #[error("signature length mismatch (expected {expected}, got {got})")]
    SignatureLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        got: usize,
    },
    /// Two indices with different shapes were merged.
    #[error("index shape mismatch (expected {expected}, got {got})")]
    Mismatch {
        /// Shape of the receiving index.
        expected: IndexShape,
        /// Shape of the other operand.
        got: IndexShape,
    },
    /// The comparison accessor had no representation for a document.
    #[error("no representation for document {0}")]
    MissingDocument(String),
    /// The same document id appeared twice in one batch of documents.
    #[error("document {0} appears more than once")]
    DuplicateDocument(String),
}

const EMPTY_BATCH: Error = Error::Config("cannot infer signature length from an empty batch");

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Signature length and band count of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexShape {
    num_hashes: usize,
    num_bands: usize,
}

impl IndexShape {
    /// Validate `n` and `b`: both non-zero, `n` divisible by `b`.
    pub fn new(num_hashes: usize, num_bands: usize) -> Result<Self> {
        if num_hashes == 0 {
            return Err(Error::Config("signature length must be >= 1"));
        }
        if num_bands == 0 {
            return Err(Error::Config("num_bands must be >= 1"));
        }
        if num_hashes % num_bands != 0 {
            return Err(Error::Indivisible {
                num_hashes,
                num_bands,
            });
        }
        Ok(Self {
            num_hashes,
            num_bands,
        })
    }

    /// Signature length `n`.
    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    /// Band count `b`.
    pub fn num_bands(&self) -> usize {
        self.num_bands
    }

    /// Rows per band `r = n / b`.
    pub fn rows_per_band(&self) -> usize {
        self.num_hashes / self.num_bands
    }

    /// Bucket keys of a signature, one per band.
    pub fn band_keys(&self, signature: &Signature) -> Result<Vec<BucketKey>> {
        if signature.len() != self.num_hashes {
            return Err(Error::SignatureLength {
                expected: self.num_hashes,
                got: signature.len(),
            });
        }
        Ok(signature
            .values
            .chunks_exact(self.rows_per_band())
            .enumerate()
            .map(|(band, rows)| BucketKey::new(band, rows))
            .collect())
    }
}

impl fmt::Display for IndexShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n={}, b={}", self.num_hashes, self.num_bands)
    }
}

/// Address of one bucket: the band index and the hash of that band's rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    /// Band index in `0..b`.
    pub band: usize,
    /// Hash of the band's `r` values, salted with `band`.
    pub hash: u64,
}

impl BucketKey {
    /// Hash one band. Byte order is fixed so keys agree across machines.
    pub fn new(band: usize, rows: &[u64]) -> Self {
        let mut hasher = Fnv1a64::new();
        hasher.write(&(band as u64).to_le_bytes());
        for v in rows {
            hasher.write(&v.to_le_bytes());
        }
        Self {
            band,
            hash: hasher.finish(),
        }
    }
}

/// One row of the flat bucket relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketRow<Id> {
    /// Document id.
    pub doc_id: Id,
    /// Band index.
    pub band: usize,
    /// Band hash (the `hash` half of the [`BucketKey`]).
    pub bucket: u64,
}

impl<Id> BucketRow<Id> {
    /// The bucket this row points at.
    pub fn key(&self) -> BucketKey {
        BucketKey {
            band: self.band,
            hash: self.bucket,
        }
    }
}

/// Mapping from `(band, bucket)` to the set of documents in that bucket.
#[derive(Debug, Clone)]
pub struct BucketIndex<Id> {
    shape: IndexShape,
    buckets: HashMap<BucketKey, BTreeSet<Id>>,
    memberships: HashMap<Id, BTreeSet<BucketKey>>,
}

impl<Id> BucketIndex<Id>
where
    Id: Clone + Eq + Hash + Ord,
{
    /// Create an empty index for signatures of length `num_hashes` cut into
    /// `num_bands` bands.
    pub fn new(num_hashes: usize, num_bands: usize) -> Result<Self> {
        Ok(Self::with_shape(IndexShape::new(num_hashes, num_bands)?))
    }

    /// Create an empty index with an already validated shape.
    pub fn with_shape(shape: IndexShape) -> Self {
        Self {
            shape,
            buckets: HashMap::new(),
            memberships: HashMap::new(),
        }
    }

    /// Build an index from `(id, signature)` pairs.
    ///
    /// The signature length `n` is taken from the input and must be shared by
    /// every signature. Nothing is returned unless the whole batch is valid. An
    /// empty batch carries no signature length and is rejected; use
    /// [`BucketIndex::new`] for an empty index.
    pub fn build<I, S>(signatures: I, num_bands: usize) -> Result<Self>
    where
        I: IntoIterator<Item = (Id, S)>,
        S: Borrow<Signature>,
    {
        let signatures: Vec<(Id, S)> = signatures.into_iter().collect();
        let num_hashes = match signatures.first() {
            Some((_, sig)) => Borrow::<Signature>::borrow(sig).len(),
            None => return Err(EMPTY_BATCH),
        };
        let mut index = Self::new(num_hashes, num_bands)?;
        index.extend(signatures)?;
        debug!(
            num_docs = index.num_documents(),
            num_buckets = index.num_buckets(),
            num_hashes,
            num_bands,
            "built bucket index"
        );
        Ok(index)
    }

    /// Build with one independent index per `batch_size` signatures on the rayon
    /// pool, then merge the partial indices by tree reduction.
    pub fn build_par(
        signatures: &[(Id, Signature)],
        num_bands: usize,
        batch_size: usize,
    ) -> Result<Self>
    where
        Id: Send + Sync,
    {
        let num_hashes = match signatures.first() {
            Some((_, sig)) => sig.len(),
            None => return Err(EMPTY_BATCH),
        };
        let shape = IndexShape::new(num_hashes, num_bands)?;
        Self::build_par_with_shape(shape, signatures, batch_size)
    }

    pub(crate) fn build_par_with_shape(
        shape: IndexShape,
        signatures: &[(Id, Signature)],
        batch_size: usize,
    ) -> Result<Self>
    where
        Id: Send + Sync,
    {
        if batch_size == 0 {
            return Err(Error::Config("batch_size must be >= 1"));
        }
        let index = signatures
            .par_chunks(batch_size)
            .map(|batch| -> Result<Self> {
                let mut partial = Self::with_shape(shape);
                partial.extend(batch.iter().map(|(id, sig)| (id.clone(), sig)))?;
                Ok(partial)
            })
            .try_reduce(
                || Self::with_shape(shape),
                |mut acc, partial| {
                    acc.merge_from(partial)?;
                    Ok(acc)
                },
            )?;
        debug!(
            num_docs = index.num_documents(),
            num_buckets = index.num_buckets(),
            batch_size,
            "built bucket index in parallel"
        );
        Ok(index)
    }

    /// Insert one document.
    pub fn insert(&mut self, id: Id, signature: &Signature) -> Result<()> {
        let keys = self.shape.band_keys(signature)?;
        self.insert_keys(id, keys);
        Ok(())
    }

    /// Insert a batch. Every signature is checked before the first insertion.
    pub fn extend<I, S>(&mut self, signatures: I) -> Result<()>
    where
        I: IntoIterator<Item = (Id, S)>,
        S: Borrow<Signature>,
    {
        let keyed = signatures
            .into_iter()
            .map(|(id, sig)| Ok((id, self.shape.band_keys(sig.borrow())?)))
            .collect::<Result<Vec<_>>>()?;
        for (id, keys) in keyed {
            self.insert_keys(id, keys);
        }
        Ok(())
    }

    fn insert_keys<K>(&mut self, id: Id, keys: K)
    where
        K: IntoIterator<Item = BucketKey>,
    {
        let membership = self.memberships.entry(id.clone()).or_default();
        for key in keys {
            self.buckets.entry(key).or_default().insert(id.clone());
            membership.insert(key);
        }
    }

    /// Union of two indices with the same shape. Both operands are left as is.
    pub fn merge(&self, other: &Self) -> Result<Self> {
        self.check_shape(other)?;
        let mut merged = self.clone();
        merged.absorb(other.buckets.iter().flat_map(|(key, ids)| {
            ids.iter().map(move |id| (*key, id.clone()))
        }));
        debug!(
            num_docs = merged.num_documents(),
            num_buckets = merged.num_buckets(),
            "merged bucket indices"
        );
        Ok(merged)
    }

    /// In-place union. The shape is checked before `self` is touched.
    pub fn merge_from(&mut self, other: Self) -> Result<()> {
        self.check_shape(&other)?;
        if self.buckets.is_empty() {
            *self = other;
            return Ok(());
        }
        self.absorb(
            other
                .buckets
                .into_iter()
                .flat_map(|(key, ids)| ids.into_iter().map(move |id| (key, id))),
        );
        Ok(())
    }

    fn check_shape(&self, other: &Self) -> Result<()> {
        if self.shape != other.shape {
            return Err(Error::Mismatch {
                expected: self.shape,
                got: other.shape,
            });
        }
        Ok(())
    }

    fn absorb<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (BucketKey, Id)>,
    {
        for (key, id) in entries {
            self.memberships.entry(id.clone()).or_default().insert(key);
            self.buckets.entry(key).or_default().insert(id);
        }
    }

    /// Flat `(doc_id, band, bucket)` view of the index.
    pub fn rows(&self) -> impl Iterator<Item = BucketRow<Id>> + '_ {
        self.buckets.iter().flat_map(|(key, ids)| {
            ids.iter().map(move |id| BucketRow {
                doc_id: id.clone(),
                band: key.band,
                bucket: key.hash,
            })
        })
    }

    /// Regroup a relation of rows, e.g. the concatenated output of several
    /// [`BucketIndex::rows`] calls, into an index.
    pub fn from_rows<I>(num_hashes: usize, num_bands: usize, rows: I) -> Result<Self>
    where
        I: IntoIterator<Item = BucketRow<Id>>,
    {
        let mut index = Self::new(num_hashes, num_bands)?;
        let rows: Vec<BucketRow<Id>> = rows.into_iter().collect();
        if rows.iter().any(|row| row.band >= num_bands) {
            return Err(Error::Config("row band index out of range"));
        }
        index.absorb(rows.into_iter().map(|row| (row.key(), row.doc_id)));
        Ok(index)
    }

    /// Members of one bucket.
    pub fn bucket(&self, key: &BucketKey) -> Option<&BTreeSet<Id>> {
        self.buckets.get(key)
    }

    /// Iterate over all buckets.
    pub fn buckets(&self) -> impl Iterator<Item = (&BucketKey, &BTreeSet<Id>)> {
        self.buckets.iter()
    }

    /// Bucket keys a document was inserted under.
    pub fn keys_of<Q>(&self, id: &Q) -> Option<&BTreeSet<BucketKey>>
    where
        Id: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.memberships.get(id)
    }

    /// True if `id` has been inserted.
    pub fn contains<Q>(&self, id: &Q) -> bool
    where
        Id: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.memberships.contains_key(id)
    }
}

impl<Id> BucketIndex<Id> {
    /// Shape of the index.
    pub fn shape(&self) -> IndexShape {
        self.shape
    }

    /// Signature length `n`.
    pub fn num_hashes(&self) -> usize {
        self.shape.num_hashes
    }

    /// Band count `b`.
    pub fn num_bands(&self) -> usize {
        self.shape.num_bands
    }

    /// Rows per band `r`.
    pub fn rows_per_band(&self) -> usize {
        self.shape.rows_per_band()
    }

    /// Number of distinct documents.
    pub fn num_documents(&self) -> usize {
        self.memberships.len()
    }

    /// Number of non-empty buckets.
    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Number of buckets holding more than one document.
    pub fn num_collision_buckets(&self) -> usize {
        self.buckets.values().filter(|ids| ids.len() > 1).count()
    }

    /// True if nothing has been inserted.
    pub fn is_empty(&self) -> bool {
        self.memberships.is_empty()
    }
}

impl<Id> PartialEq for BucketIndex<Id>
where
    Id: Eq + Hash + Ord,
{
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.buckets == other.buckets
    }
}

impl<Id> Eq for BucketIndex<Id> where Id: Eq + Hash + Ord {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minhash::HashFamily;

    fn sig(values: &[u64]) -> Signature {
        Signature {
            values: values.to_vec(),
        }
    }

    #[test]
    fn shape_validation() {
        assert!(IndexShape::new(240, 80).is_ok());
        assert_eq!(
            IndexShape::new(10, 3),
            Err(Error::Indivisible {
                num_hashes: 10,
                num_bands: 3
            })
        );
        assert!(matches!(IndexShape::new(0, 1), Err(Error::Config(_))));
        assert!(matches!(IndexShape::new(8, 0), Err(Error::Config(_))));
        assert_eq!(IndexShape::new(240, 80).unwrap().rows_per_band(), 3);
    }

    #[test]
    fn identical_band_contents_in_different_bands_do_not_collide() {
        let a = BucketKey::new(0, &[7, 7]);
        let b = BucketKey::new(1, &[7, 7]);
        assert_ne!(a, b);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn build_places_each_doc_in_every_band() {
        let ix = BucketIndex::build(
            vec![("a", sig(&[1, 2, 3, 4])), ("b", sig(&[1, 2, 9, 9]))],
            2,
        )
        .unwrap();
        assert_eq!(ix.num_documents(), 2);
        assert_eq!(ix.keys_of("a").unwrap().len(), 2);
        // band 0 is shared, band 1 is not
        assert_eq!(ix.num_buckets(), 3);
        assert_eq!(ix.num_collision_buckets(), 1);
        let shared = BucketKey::new(0, &[1, 2]);
        let members: Vec<&str> = ix.bucket(&shared).unwrap().iter().copied().collect();
        assert_eq!(members, vec!["a", "b"]);
    }

    #[test]
    fn build_rejects_indivisible_band_count() {
        let err = BucketIndex::build(vec![("a", sig(&[1, 2, 3, 4, 5]))], 2).unwrap_err();
        assert_eq!(
            err,
            Error::Indivisible {
                num_hashes: 5,
                num_bands: 2
            }
        );
    }

    #[test]
    fn build_rejects_mixed_lengths() {
        let err = BucketIndex::build(
            vec![("a", sig(&[1, 2])), ("b", sig(&[1, 2, 3, 4]))],
            2,
        )
        .unwrap_err();
        assert_eq!(err, Error::SignatureLength { expected: 2, got: 4 });
    }

    #[test]
    fn build_rejects_empty_batch() {
        let empty: Vec<(&str, Signature)> = Vec::new();
        assert!(matches!(BucketIndex::build(empty, 2), Err(Error::Config(_))));
    }

    #[test]
    fn extend_is_all_or_nothing() {
        let mut ix = BucketIndex::new(4, 2).unwrap();
        ix.insert("a", &sig(&[1, 2, 3, 4])).unwrap();
        let before = ix.clone();
        let err = ix
            .extend(vec![("b", sig(&[1, 2, 3, 4])), ("c", sig(&[1, 2]))])
            .unwrap_err();
        assert_eq!(err, Error::SignatureLength { expected: 4, got: 2 });
        assert_eq!(ix, before);
        assert!(!ix.contains("b"));
    }

    #[test]
    fn merge_rejects_shape_mismatch_and_leaves_operands() {
        let mut a = BucketIndex::new(4, 2).unwrap();
        a.insert("a", &sig(&[1, 2, 3, 4])).unwrap();
        let mut b = BucketIndex::new(4, 4).unwrap();
        b.insert("b", &sig(&[1, 2, 3, 4])).unwrap();
        let a_before = a.clone();

        let err = a.merge(&b).unwrap_err();
        assert!(matches!(err, Error::Mismatch { .. }));
        assert_eq!(
            err.to_string(),
            "index shape mismatch (expected n=4, b=2, got n=4, b=4)"
        );

        assert!(a.merge_from(b).is_err());
        assert_eq!(a, a_before);
    }

    #[test]
    fn merge_is_union() {
        let a = BucketIndex::build(vec![("a", sig(&[1, 2, 3, 4]))], 2).unwrap();
        let b = BucketIndex::build(vec![("b", sig(&[1, 2, 5, 6]))], 2).unwrap();
        let ab = a.merge(&b).unwrap();
        assert_eq!(ab.num_documents(), 2);
        assert_eq!(ab.num_collision_buckets(), 1);
        assert_eq!(ab, b.merge(&a).unwrap());

        let mut inplace = a.clone();
        inplace.merge_from(b).unwrap();
        assert_eq!(inplace, ab);
    }

    #[test]
    fn merge_with_itself_is_idempotent() {
        let a = BucketIndex::build(
            vec![("a", sig(&[1, 2, 3, 4])), ("b", sig(&[4, 3, 2, 1]))],
            2,
        )
        .unwrap();
        assert_eq!(a.merge(&a).unwrap(), a);
    }

    #[test]
    fn rows_round_trip_through_concatenation() {
        let a = BucketIndex::build(vec![("a".to_string(), sig(&[1, 2, 3, 4]))], 2).unwrap();
        let b = BucketIndex::build(vec![("b".to_string(), sig(&[1, 2, 5, 6]))], 2).unwrap();

        let mut relation: Vec<BucketRow<String>> = a.rows().collect();
        relation.extend(b.rows());
        assert_eq!(relation.len(), 4);

        let regrouped = BucketIndex::from_rows(4, 2, relation).unwrap();
        assert_eq!(regrouped, a.merge(&b).unwrap());
        assert!(regrouped.contains("a"));
    }

    #[test]
    fn from_rows_rejects_out_of_range_band() {
        let rows = vec![BucketRow {
            doc_id: 1u32,
            band: 5,
            bucket: 0,
        }];
        assert!(matches!(
            BucketIndex::from_rows(4, 2, rows),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn rows_serialize_as_json_lines() {
        let ix = BucketIndex::build(vec![("a".to_string(), sig(&[1, 2, 3, 4]))], 2).unwrap();
        let lines: Vec<String> = ix
            .rows()
            .map(|row| serde_json::to_string(&row).unwrap())
            .collect();
        let parsed: Vec<BucketRow<String>> = lines
            .iter()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(BucketIndex::from_rows(4, 2, parsed).unwrap(), ix);
    }

    #[test]
    fn parallel_build_matches_sequential() {
        let fam = HashFamily::generate(17, 32).unwrap();
        let sigs: Vec<(u32, Signature)> = (0..50u32)
            .map(|i| (i, fam.compute_signature([i, i + 1, i + 2]).unwrap()))
            .collect();
        let seq = BucketIndex::build(sigs.iter().map(|(id, s)| (*id, s)), 8).unwrap();
        let par = BucketIndex::build_par(&sigs, 8, 7).unwrap();
        assert_eq!(seq, par);
        assert!(matches!(
            BucketIndex::build_par(&sigs, 8, 0),
            Err(Error::Config(_))
        ));
    }
}
