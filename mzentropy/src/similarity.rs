//! Entropy-based similarity between peak lists.
//!
//! The similarity of two spectra is derived from the Shannon entropy of
//! their merged intensity distribution relative to the individual
//! distributions[^1]:
//!
//! ```math
//! D(p, q) = 2H(p + q) - H(p) - H(q)
//! ```
//!
//! normalized by `ln 4` so that disjoint spectra score 0 and identical
//! spectra score 1. Sparse spectra are dampened by intensity reweighting
//! before the distance is taken.
//!
//! # References
//! [^1]: Li, Y., Kind, T., Folz, J., Vaniya, A., Mehta. S. S., Fiehn, O.
//!       (2021). Spectral entropy outperforms MS/MS dot product similarity
//!       for small-molecule compound identification. Nature Methods, 18,
//!       1524-1531. <https://doi.org/10.1038/s41592-021-01331-z>

use mzpeaks::{CentroidPeak, Tolerance};

use crate::matching::{match_peak_indices, match_peaks};

/// Base exponent of the intensity reweighting applied to low-entropy spectra
pub const WEIGHT_START: f64 = 0.25;
/// Per-nat increment of the reweighting exponent
pub const WEIGHT_SLOPE: f64 = 0.25;
/// Spectra at or above this entropy are left unweighted
pub const WEIGHT_ENTROPY_CUTOFF: f64 = 3.0;

/// Shannon entropy (natural log) of the distribution obtained by
/// sum-normalizing the positive components of `intensities`.
pub fn spectral_entropy(intensities: &[f64]) -> f64 {
    let total: f64 = intensities.iter().filter(|x| **x > 0.0).sum();
    if total <= 0.0 {
        return 0.0;
    }
    intensities
        .iter()
        .filter(|x| **x > 0.0)
        .map(|x| {
            let p = x / total;
            -p * p.ln()
        })
        .sum()
}

/// Reweight an intensity vector whose entropy falls below
/// [`WEIGHT_ENTROPY_CUTOFF`] by raising each component to
/// `WEIGHT_START + WEIGHT_SLOPE * H`, renormalizing to sum 1.
fn weight_intensities(intensities: &mut [f64]) {
    let total: f64 = intensities.iter().filter(|x| **x > 0.0).sum();
    if total <= 0.0 {
        return;
    }
    let entropy = spectral_entropy(intensities);
    if entropy >= WEIGHT_ENTROPY_CUTOFF {
        return;
    }
    let weight = WEIGHT_START + WEIGHT_SLOPE * entropy;
    for x in intensities.iter_mut() {
        *x = x.powf(weight);
    }
    let total: f64 = intensities.iter().sum();
    if total > 0.0 {
        for x in intensities.iter_mut() {
            *x /= total;
        }
    }
}

/// Entropy distance between two aligned intensity vectors, each reweighted
/// independently first. Ranges over `[0, ln 4]`.
pub fn entropy_distance(mut p: Vec<f64>, mut q: Vec<f64>) -> f64 {
    weight_intensities(&mut p);
    weight_intensities(&mut q);
    let merged: Vec<f64> = p.iter().zip(q.iter()).map(|(a, b)| a + b).collect();
    2.0 * spectral_entropy(&merged) - spectral_entropy(&p) - spectral_entropy(&q)
}

fn similarity_from_distance(distance: f64) -> f64 {
    1.0 - distance / 4.0f64.ln()
}

/// Entropy similarity of two cleaned, m/z-sorted peak lists.
///
/// Either operand being empty yields 0 without matching.
pub fn entropy_similarity(
    spec_a: &[CentroidPeak],
    spec_b: &[CentroidPeak],
    tolerance: Tolerance,
) -> f64 {
    if spec_a.is_empty() || spec_b.is_empty() {
        return 0.0;
    }
    let rows = match_peaks(spec_a, spec_b, tolerance);
    let p: Vec<f64> = rows.iter().map(|r| r.intensity_a as f64).collect();
    let q: Vec<f64> = rows.iter().map(|r| r.intensity_b as f64).collect();
    similarity_from_distance(entropy_distance(p, q))
}

/// Entropy similarity that also credits query fragments offset by
/// `precursor_mz_delta` (query precursor m/z minus library precursor m/z),
/// as produced by a modification on the query compound.
///
/// The query is matched against the library twice, directly and after
/// shifting its peaks down by the delta. Each query peak keeps whichever
/// library partner carries the higher intensity, the direct partner winning
/// ties. Matched query intensity is pooled into its partner's bin; peaks
/// unmatched on either side stand alone. A query with no matched peak at
/// all scores 0.
pub fn shifted_entropy_similarity(
    query: &[CentroidPeak],
    library: &[CentroidPeak],
    precursor_mz_delta: f64,
    tolerance: Tolerance,
) -> f64 {
    if query.is_empty() || library.is_empty() {
        return 0.0;
    }

    let mut partners = match_peak_indices(query, library, tolerance);
    let shifted_query: Vec<CentroidPeak> = query
        .iter()
        .map(|p| CentroidPeak::new(p.mz - precursor_mz_delta, p.intensity, p.index))
        .collect();
    let shifted = match_peak_indices(&shifted_query, library, tolerance);

    for (slot, candidate) in partners.iter_mut().zip(shifted) {
        if let Some(s) = candidate {
            let improves = match *slot {
                None => true,
                Some(d) => library[s as usize].intensity > library[d as usize].intensity,
            };
            if improves {
                *slot = Some(s);
            }
        }
    }

    if partners.iter().all(Option::is_none) {
        return 0.0;
    }

    // Pool matched query intensity into the partner's library bin; what is
    // left unmatched on either side keeps its own bin.
    let mut residual: Vec<f64> = query.iter().map(|p| p.intensity as f64).collect();
    let mut pooled = vec![0.0f64; library.len()];
    for (i, partner) in partners.iter().enumerate() {
        if let Some(b) = partner {
            pooled[*b as usize] += residual[i];
            residual[i] = 0.0;
        }
    }

    let mut p = residual;
    p.extend_from_slice(&pooled);
    let mut q = vec![0.0f64; query.len()];
    q.extend(library.iter().map(|x| x.intensity as f64));
    similarity_from_distance(entropy_distance(p, q))
}
