//! Peak list cleaning applied to spectra before indexing and scoring.

use itertools::Itertools;
use mzpeaks::{CentroidPeak, Tolerance};

pub type PeakList = Vec<CentroidPeak>;

/// Sort a peak list by m/z ascending.
pub fn sort_by_mz(peaks: &mut [CentroidPeak]) {
    peaks.sort_by(|a, b| a.mz.total_cmp(&b.mz));
}

fn reindex(peaks: &mut [CentroidPeak]) {
    for (i, p) in peaks.iter_mut().enumerate() {
        p.index = i as u32;
    }
}

/// Rescale a peak list so the intensities sum to 1. A list whose total
/// intensity is not positive is left untouched.
pub fn normalize_intensity(peaks: &mut [CentroidPeak]) {
    let total: f64 = peaks.iter().map(|p| p.intensity as f64).sum();
    if total > 0.0 {
        for p in peaks.iter_mut() {
            p.intensity = (p.intensity as f64 / total) as f32;
        }
    }
}

fn needs_centroiding(peaks: &[CentroidPeak], tolerance: Tolerance) -> bool {
    peaks
        .iter()
        .tuple_windows()
        .any(|(a, b)| tolerance.test(b.mz, a.mz))
}

/// Merge peaks closer together than `tolerance` into single peaks at the
/// intensity-weighted mean m/z.
///
/// Peaks are visited in descending intensity order. Each seed absorbs every
/// not-yet-absorbed neighbor whose m/z lies within the tolerance window
/// around the seed m/z; absorbed peaks are zeroed out so they can neither
/// seed a later merge nor contribute to one. The merged list is returned
/// sorted by m/z.
pub fn centroid_peaks(peaks: PeakList, tolerance: Tolerance) -> PeakList {
    if !needs_centroiding(&peaks, tolerance) {
        return peaks;
    }

    let mut scratch = peaks;
    let mut order: Vec<usize> = (0..scratch.len()).collect();
    order.sort_by(|&i, &j| scratch[j].intensity.total_cmp(&scratch[i].intensity));

    let mut merged = PeakList::with_capacity(scratch.len());
    for seed in order {
        if scratch[seed].intensity <= 0.0 {
            continue;
        }
        let (low, high) = tolerance.bounds(scratch[seed].mz);
        let mut left = seed;
        while left > 0 && scratch[left - 1].mz >= low {
            left -= 1;
        }
        let mut right = seed + 1;
        while right < scratch.len() && scratch[right].mz <= high {
            right += 1;
        }

        let mut total = 0.0f64;
        let mut weighted = 0.0f64;
        for p in &scratch[left..right] {
            total += p.intensity as f64;
            weighted += p.mz * p.intensity as f64;
        }
        merged.push(CentroidPeak::new(weighted / total, total as f32, 0));
        for p in &mut scratch[left..right] {
            p.intensity = 0.0;
        }
    }

    sort_by_mz(&mut merged);
    merged
}

/// Cleans raw peak lists: drops unusable peaks, centroids near-duplicates,
/// normalizes intensity, and optionally strips low-signal noise.
#[derive(Debug, Clone, Copy)]
pub struct PeakCleaner {
    /// The m/z window within which raw peaks are considered duplicates
    pub tolerance: Tolerance,
    /// Width in Da below the precursor m/z above which peaks are discarded
    pub precursor_removal: Option<f64>,
    /// Fraction of the base peak intensity below which peaks are treated as noise
    pub noise_fraction: Option<f32>,
}

impl Default for PeakCleaner {
    fn default() -> Self {
        Self {
            tolerance: Tolerance::Da(0.02),
            precursor_removal: None,
            noise_fraction: None,
        }
    }
}

impl PeakCleaner {
    pub fn new(
        tolerance: Tolerance,
        precursor_removal: Option<f64>,
        noise_fraction: Option<f32>,
    ) -> Self {
        Self {
            tolerance,
            precursor_removal,
            noise_fraction,
        }
    }

    /// Clean `peaks`, removing the precursor region when both a removal
    /// window and a precursor m/z are known.
    pub fn clean(&self, peaks: &[CentroidPeak], precursor_mz: Option<f64>) -> PeakList {
        let max_mz = match (self.precursor_removal, precursor_mz) {
            (Some(window), Some(mz)) => Some(mz - window),
            _ => None,
        };
        self.clean_with_limit(peaks, max_mz)
    }

    /// Clean `peaks`, dropping everything at or above `max_mz` when given.
    ///
    /// The empty list is a valid result: a spectrum whose peaks are all
    /// filtered away has no usable signal.
    pub fn clean_with_limit(&self, peaks: &[CentroidPeak], max_mz: Option<f64>) -> PeakList {
        let mut kept: PeakList = peaks
            .iter()
            .filter(|p| {
                p.mz > 0.0 && p.intensity > 0.0 && max_mz.map_or(true, |limit| p.mz < limit)
            })
            .cloned()
            .collect();
        sort_by_mz(&mut kept);

        let mut kept = if kept.len() > 1 {
            centroid_peaks(kept, self.tolerance)
        } else {
            kept
        };

        normalize_intensity(&mut kept);
        if let Some(noise_fraction) = self.noise_fraction {
            drop_noise(&mut kept, noise_fraction);
        }
        reindex(&mut kept);
        kept
    }
}

fn drop_noise(peaks: &mut PeakList, noise_fraction: f32) {
    let Some(base) = peaks
        .iter()
        .map(|p| p.intensity)
        .max_by(f32::total_cmp)
    else {
        return;
    };
    let threshold = base * noise_fraction;
    peaks.retain(|p| p.intensity > threshold);
    normalize_intensity(peaks);
}

#[cfg(test)]
mod test {
    use super::*;

    fn peak(mz: f64, intensity: f32) -> CentroidPeak {
        CentroidPeak::new(mz, intensity, 0)
    }

    fn total_intensity(peaks: &[CentroidPeak]) -> f64 {
        peaks.iter().map(|p| p.intensity as f64).sum()
    }

    #[test]
    fn test_centroid_merges_near_duplicates() {
        let peaks = vec![peak(100.0, 1.0), peak(100.0005, 0.5)];
        let merged = centroid_peaks(peaks, Tolerance::Da(0.01));
        assert_eq!(merged.len(), 1);
        assert!((merged[0].mz - 100.000167).abs() < 1e-5);
        assert!((merged[0].intensity - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_centroid_keeps_separated_peaks() {
        let peaks = vec![peak(100.0, 1.0), peak(100.5, 0.5), peak(101.0, 0.25)];
        let merged = centroid_peaks(peaks.clone(), Tolerance::Da(0.01));
        assert_eq!(merged.len(), peaks.len());
    }

    #[test]
    fn test_clean_normalizes() {
        let cleaner = PeakCleaner::default();
        let cleaned = cleaner.clean_with_limit(
            &[peak(50.0, 20.0), peak(60.0, 10.0), peak(75.0, 10.0)],
            None,
        );
        assert_eq!(cleaned.len(), 3);
        assert!((total_intensity(&cleaned) - 1.0).abs() < 1e-6);
        assert!((cleaned[0].intensity - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_clean_drops_invalid_and_precursor_region() {
        let cleaner = PeakCleaner::default();
        let cleaned = cleaner.clean(
            &[
                peak(-5.0, 1.0),
                peak(50.0, 0.0),
                peak(60.0, 1.0),
                peak(99.5, 1.0),
            ],
            Some(100.0 + 1.6),
        );
        // cleaner has no removal window configured, so 99.5 survives
        assert_eq!(cleaned.len(), 2);

        let cleaner = PeakCleaner {
            precursor_removal: Some(1.6),
            ..PeakCleaner::default()
        };
        let cleaned = cleaner.clean(
            &[peak(60.0, 1.0), peak(99.5, 1.0), peak(100.0, 1.0)],
            Some(100.0),
        );
        assert_eq!(cleaned.len(), 1);
        assert!((cleaned[0].mz - 60.0).abs() < 1e-9);
        assert!((cleaned[0].intensity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_clean_is_idempotent() {
        let cleaner = PeakCleaner {
            noise_fraction: Some(0.01),
            ..PeakCleaner::default()
        };
        let raw = vec![
            peak(100.0, 5.0),
            peak(100.001, 2.0),
            peak(150.7, 1.0),
            peak(180.2, 0.02),
            peak(220.9, 3.0),
        ];
        let once = cleaner.clean_with_limit(&raw, None);
        let twice = cleaner.clean_with_limit(&once, None);
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert!((a.mz - b.mz).abs() < 1e-9);
            assert!((a.intensity - b.intensity).abs() < 1e-6);
        }
    }

    #[test]
    fn test_clean_empty_and_single_peak() {
        let cleaner = PeakCleaner::default();
        assert!(cleaner.clean_with_limit(&[], None).is_empty());
        assert!(cleaner
            .clean_with_limit(&[peak(100.0, -3.0)], None)
            .is_empty());

        let single = cleaner.clean_with_limit(&[peak(100.0, 42.0)], None);
        assert_eq!(single.len(), 1);
        assert!((single[0].intensity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_noise_filter_renormalizes() {
        let cleaner = PeakCleaner {
            noise_fraction: Some(0.1),
            ..PeakCleaner::default()
        };
        let cleaned = cleaner.clean_with_limit(
            &[peak(50.0, 100.0), peak(60.0, 50.0), peak(70.0, 1.0)],
            None,
        );
        assert_eq!(cleaned.len(), 2);
        assert!((total_intensity(&cleaned) - 1.0).abs() < 1e-6);
    }
}
