//! Banding S-curve: how `h` (signature length) and `b` (bands) trade recall for
//! precision.
//!
//! With `r = h / b` rows per band, a pair with Jaccard similarity `s` becomes a
//! candidate with probability \(1 - (1 - s^r)^b\). The curve's knee sits near
//! \((1/b)^{1/r}\). These functions are advisory: use them to pick `h` and `b`
//! before indexing.
//!
//! `b` must be at least 1. `h` need not be a multiple of `b` here, but an index
//! only accepts shapes where it is.

/// Similarity at which a pair has roughly even odds of becoming a candidate.
///
/// Requires `b >= 1`; debug builds panic otherwise.
pub fn threshold(h: usize, b: usize) -> f64 {
    debug_assert!(b >= 1, "band count must be >= 1");
    let b = b as f64;
    let r = h as f64 / b;
    (1.0 / b).powf(1.0 / r)
}

/// Probability that a pair with Jaccard similarity `s` shares at least one band.
///
/// Requires `b >= 1` and `s` in `[0, 1]`; debug builds panic otherwise.
pub fn probability(h: usize, b: usize, s: f64) -> f64 {
    debug_assert!(b >= 1, "band count must be >= 1");
    debug_assert!((0.0..=1.0).contains(&s), "similarity {s} outside [0, 1]");
    let b = b as f64;
    let r = h as f64 / b;
    1.0 - (1.0 - s.powf(r)).powf(b)
}

/// Probability that a pair with similarity `s` is missed.
///
/// Same preconditions as [`probability`].
pub fn false_negative_rate(h: usize, b: usize, s: f64) -> f64 {
    1.0 - probability(h, b, s)
}

/// Band count dividing `h` whose [`threshold`] lies closest to `target`.
///
/// Returns `None` when `h == 0`.
pub fn bands_for_threshold(h: usize, target: f64) -> Option<usize> {
    (1..=h)
        .filter(|b| h % b == 0)
        .min_by(|&x, &y| {
            let dx = (threshold(h, x) - target).abs();
            let dy = (threshold(h, y) - target).abs();
            dx.total_cmp(&dy)
        })
}
