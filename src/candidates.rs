//! Candidate extraction from a [`BucketIndex`].
//!
//! Two documents are candidates when they share at least one bucket, i.e. agree
//! on every row of at least one band. Work is proportional to bucket occupancy,
//! not to the number of document pairs in the corpus.

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::hash::Hash;

use serde::Serialize;
use tracing::debug;

use crate::lsh::{BucketIndex, Result};
use crate::minhash::Signature;

/// An unordered pair of document ids, stored with the smaller id first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CandidatePair<Id> {
    first: Id,
    second: Id,
}

impl<Id: Ord> CandidatePair<Id> {
    /// Canonicalize `(a, b)` so that `new(a, b) == new(b, a)`.
    pub fn new(a: Id, b: Id) -> Self {
        if a <= b {
            Self {
                first: a,
                second: b,
            }
        } else {
            Self {
                first: b,
                second: a,
            }
        }
    }
}

impl<Id> CandidatePair<Id> {
    /// The smaller id.
    pub fn first(&self) -> &Id {
        &self.first
    }

    /// The larger id.
    pub fn second(&self) -> &Id {
        &self.second
    }

    /// Both ids, smaller first.
    pub fn into_inner(self) -> (Id, Id) {
        (self.first, self.second)
    }
}

impl<Id: Ord> From<(Id, Id)> for CandidatePair<Id> {
    fn from((a, b): (Id, Id)) -> Self {
        Self::new(a, b)
    }
}

/// Documents sharing at least one bucket with `id`, excluding `id` itself.
///
/// Unknown ids have no buckets and yield an empty set.
pub fn query<Id, Q>(index: &BucketIndex<Id>, id: &Q) -> BTreeSet<Id>
where
    Id: Clone + Eq + Hash + Ord + Borrow<Q>,
    Q: ?Sized + Hash + Eq,
{
    let mut out = BTreeSet::new();
    let Some(keys) = index.keys_of(id) else {
        return out;
    };
    for key in keys {
        if let Some(members) = index.bucket(key) {
            out.extend(
                members
                    .iter()
                    .filter(|m| Borrow::<Q>::borrow(*m) != id)
                    .cloned(),
            );
        }
    }
    out
}

/// Indexed documents sharing at least one bucket with a probe signature.
///
/// The probe is not inserted. Fails if its length differs from the index's.
pub fn query_signature<Id>(
    index: &BucketIndex<Id>,
    signature: &Signature,
) -> Result<BTreeSet<Id>>
where
    Id: Clone + Eq + Hash + Ord,
{
    let mut out = BTreeSet::new();
    for key in index.shape().band_keys(signature)? {
        if let Some(members) = index.bucket(&key) {
            out.extend(members.iter().cloned());
        }
    }
    Ok(out)
}

/// Every unordered pair of documents that share a bucket, each pair once.
pub fn all_candidates<Id>(index: &BucketIndex<Id>) -> BTreeSet<CandidatePair<Id>>
where
    Id: Clone + Eq + Hash + Ord,
{
    let mut pairs = BTreeSet::new();
    for (_, members) in index.buckets() {
        if members.len() < 2 {
            continue;
        }
        // members are sorted, so (a, b) is already canonical
        let members: Vec<&Id> = members.iter().collect();
        for (i, a) in members.iter().enumerate() {
            for b in &members[i + 1..] {
                pairs.insert(CandidatePair {
                    first: (*a).clone(),
                    second: (*b).clone(),
                });
            }
        }
    }
    debug!(
        num_pairs = pairs.len(),
        num_collision_buckets = index.num_collision_buckets(),
        "extracted candidate pairs"
    );
    pairs
}
