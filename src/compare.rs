//! Exact scoring of candidate pairs.
//!
//! The caller supplies an accessor that resolves a document id to whatever
//! representation its similarity function compares (token sets, raw text, ...).
//! The similarity function runs once per supplied pair and never on any pair
//! outside that set. All representations are resolved before scoring starts, so
//! a missing document fails the call without running the similarity function.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use rayon::prelude::*;
use tracing::debug;

use crate::candidates::CandidatePair;
use crate::lsh::{Error, Result};

/// Score every pair with `similarity`.
///
/// `accessor` returns `None` for unknown ids, which fails the whole call with
/// [`Error::MissingDocument`].
pub fn compare<'p, Id, R, P, A, F>(
    pairs: P,
    accessor: A,
    similarity: F,
) -> Result<HashMap<CandidatePair<Id>, f64>>
where
    Id: 'p + Clone + Eq + Hash + Debug,
    P: IntoIterator<Item = &'p CandidatePair<Id>>,
    A: Fn(&Id) -> Option<R>,
    F: Fn(&R, &R) -> f64,
{
    let resolved = pairs
        .into_iter()
        .map(|pair| resolve(pair, &accessor))
        .collect::<Result<Vec<_>>>()?;
    let scores: HashMap<CandidatePair<Id>, f64> = resolved
        .into_iter()
        .map(|(pair, a, b)| (pair.clone(), similarity(&a, &b)))
        .collect();
    debug!(num_pairs = scores.len(), "scored candidate pairs");
    Ok(scores)
}

/// Parallel [`compare`] on the rayon pool.
pub fn compare_par<'p, Id, R, P, A, F>(
    pairs: P,
    accessor: A,
    similarity: F,
) -> Result<HashMap<CandidatePair<Id>, f64>>
where
    Id: 'p + Clone + Eq + Hash + Debug + Send + Sync,
    R: Send,
    P: IntoParallelIterator<Item = &'p CandidatePair<Id>>,
    A: Fn(&Id) -> Option<R> + Sync,
    F: Fn(&R, &R) -> f64 + Sync,
{
    let resolved = pairs
        .into_par_iter()
        .map(|pair| resolve(pair, &accessor))
        .collect::<Result<Vec<_>>>()?;
    let scores: HashMap<CandidatePair<Id>, f64> = resolved
        .into_par_iter()
        .map(|(pair, a, b)| (pair.clone(), similarity(&a, &b)))
        .collect();
    debug!(num_pairs = scores.len(), "scored candidate pairs in parallel");
    Ok(scores)
}

type Resolved<'p, Id, R> = (&'p CandidatePair<Id>, R, R);

fn resolve<'p, Id, R, A>(
    pair: &'p CandidatePair<Id>,
    accessor: &A,
) -> Result<Resolved<'p, Id, R>>
where
    Id: Debug,
    A: Fn(&Id) -> Option<R>,
{
    let fetch = |id: &Id| {
        accessor(id).ok_or_else(|| Error::MissingDocument(format!("{id:?}")))
    };
    Ok((pair, fetch(pair.first())?, fetch(pair.second())?))
}

/// Exact Jaccard similarity of two sets. Two empty sets are identical.
pub fn jaccard_similarity<T: Eq + Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}
