//! Tolerance-window alignment of two m/z-sorted peak lists.

use mzpeaks::{CentroidPeak, Tolerance};

/// One row of a peak list alignment: an m/z position with the intensity
/// contributed by each spectrum at that position. A zero on either side
/// means the peak was only present in the other spectrum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchedPeak {
    pub mz: f64,
    pub intensity_a: f32,
    pub intensity_b: f32,
}

impl MatchedPeak {
    pub fn new(mz: f64, intensity_a: f32, intensity_b: f32) -> Self {
        Self {
            mz,
            intensity_a,
            intensity_b,
        }
    }
}

/// Align two m/z-sorted peak lists under `tolerance`, merging every peak of
/// `spec_b` that falls in the window around a `spec_a` peak into that peak's
/// row. Peaks without a partner are emitted as rows with a zero intensity on
/// the other side, so the intensity columns of the output conserve the
/// totals of the inputs.
///
/// ppm windows are computed from the current `spec_a` m/z.
pub fn match_peaks(
    spec_a: &[CentroidPeak],
    spec_b: &[CentroidPeak],
    tolerance: Tolerance,
) -> Vec<MatchedPeak> {
    let mut rows = Vec::with_capacity(spec_a.len() + spec_b.len());
    let mut a = 0usize;
    let mut b = 0usize;
    let mut pending_b = 0.0f32;

    while a < spec_a.len() && b < spec_b.len() {
        let (low, high) = tolerance.bounds(spec_a[a].mz);
        if spec_b[b].mz > high {
            rows.push(MatchedPeak::new(
                spec_a[a].mz,
                spec_a[a].intensity,
                pending_b,
            ));
            pending_b = 0.0;
            a += 1;
        } else if spec_b[b].mz < low {
            rows.push(MatchedPeak::new(spec_b[b].mz, 0.0, spec_b[b].intensity));
            b += 1;
        } else {
            pending_b += spec_b[b].intensity;
            b += 1;
        }
    }

    // `spec_b` ran out while accumulating against the current `spec_a` peak
    if pending_b > 0.0 {
        rows.push(MatchedPeak::new(
            spec_a[a].mz,
            spec_a[a].intensity,
            pending_b,
        ));
        a += 1;
    }
    for p in &spec_b[b..] {
        rows.push(MatchedPeak::new(p.mz, 0.0, p.intensity));
    }
    for p in &spec_a[a..] {
        rows.push(MatchedPeak::new(p.mz, p.intensity, 0.0));
    }
    rows
}

/// Index-returning variant of [`match_peaks`]: slot `i` of the result holds
/// the `spec_b` index matched to `spec_a[i]`, or `None` when that peak found
/// no partner. When several `spec_b` peaks fall in one window, the most
/// intense one is kept.
pub fn match_peak_indices(
    spec_a: &[CentroidPeak],
    spec_b: &[CentroidPeak],
    tolerance: Tolerance,
) -> Vec<Option<u32>> {
    let mut partners: Vec<Option<u32>> = vec![None; spec_a.len()];
    let mut a = 0usize;
    let mut b = 0usize;
    let mut pending: Option<u32> = None;

    while a < spec_a.len() && b < spec_b.len() {
        let (low, high) = tolerance.bounds(spec_a[a].mz);
        if spec_b[b].mz > high {
            partners[a] = pending.take();
            a += 1;
        } else if spec_b[b].mz < low {
            b += 1;
        } else {
            pending = match pending {
                Some(prev) if spec_b[prev as usize].intensity >= spec_b[b].intensity => Some(prev),
                _ => Some(b as u32),
            };
            b += 1;
        }
    }
    if a < spec_a.len() {
        partners[a] = pending;
    }
    partners
}

#[cfg(test)]
mod test {
    use super::*;

    fn peaks(raw: &[(f64, f32)]) -> Vec<CentroidPeak> {
        raw.iter()
            .enumerate()
            .map(|(i, (mz, intensity))| CentroidPeak::new(*mz, *intensity, i as u32))
            .collect()
    }

    fn column_sums(rows: &[MatchedPeak]) -> (f64, f64) {
        rows.iter().fold((0.0, 0.0), |(a, b), row| {
            (a + row.intensity_a as f64, b + row.intensity_b as f64)
        })
    }

    #[test]
    fn test_match_pairs_within_tolerance() {
        let a = peaks(&[(50.0, 0.5), (60.0, 0.5)]);
        let b = peaks(&[(50.005, 0.4), (60.002, 0.6)]);
        let rows = match_peaks(&a, &b, Tolerance::Da(0.01));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], MatchedPeak::new(50.0, 0.5, 0.4));
        assert_eq!(rows[1], MatchedPeak::new(60.0, 0.5, 0.6));
    }

    #[test]
    fn test_match_emits_unmatched_rows() {
        let a = peaks(&[(50.0, 1.0)]);
        let b = peaks(&[(75.0, 0.25)]);
        let rows = match_peaks(&a, &b, Tolerance::Da(0.01));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], MatchedPeak::new(50.0, 1.0, 0.0));
        assert_eq!(rows[1], MatchedPeak::new(75.0, 0.0, 0.25));
    }

    #[test]
    fn test_match_accumulates_multiple_partners() {
        let a = peaks(&[(100.0, 1.0)]);
        let b = peaks(&[(99.995, 0.25), (100.005, 0.5)]);
        let rows = match_peaks(&a, &b, Tolerance::Da(0.01));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], MatchedPeak::new(100.0, 1.0, 0.75));
    }

    #[test]
    fn test_match_conserves_intensity() {
        let a = peaks(&[(50.0, 0.3), (60.0, 0.2), (80.0, 0.5)]);
        let b = peaks(&[(49.9, 0.1), (60.001, 0.4), (60.004, 0.2), (95.0, 0.3)]);
        let rows = match_peaks(&a, &b, Tolerance::Da(0.01));
        let (sum_a, sum_b) = column_sums(&rows);
        assert!((sum_a - 1.0).abs() < 1e-6);
        assert!((sum_b - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_match_ppm_window_scales_with_mz() {
        let a = peaks(&[(1000.0, 1.0)]);
        let b = peaks(&[(1000.008, 1.0)]);
        // 10 ppm at m/z 1000 is 0.01 Da
        let rows = match_peaks(&a, &b, Tolerance::PPM(10.0));
        assert_eq!(rows.len(), 1);
        let rows = match_peaks(&a, &b, Tolerance::PPM(5.0));
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_match_indices_prefers_most_intense_partner() {
        let a = peaks(&[(100.0, 1.0), (200.0, 1.0)]);
        let b = peaks(&[(99.995, 0.25), (100.005, 0.5), (150.0, 1.0)]);
        let partners = match_peak_indices(&a, &b, Tolerance::Da(0.01));
        assert_eq!(partners, vec![Some(1), None]);
    }

    #[test]
    fn test_match_indices_trailing_partner() {
        let a = peaks(&[(100.0, 1.0), (200.0, 1.0)]);
        let b = peaks(&[(200.002, 0.75)]);
        let partners = match_peak_indices(&a, &b, Tolerance::Da(0.01));
        assert_eq!(partners, vec![None, Some(0)]);
    }
}
