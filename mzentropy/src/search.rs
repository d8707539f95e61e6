//! Per-query search orchestration: candidate retrieval, scoring, ranking.

use mzpeaks::{CentroidPeak, Tolerance};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::index::{EntryId, LibraryIndex, Polarity};
use crate::peaks::{PeakCleaner, PeakList};
use crate::similarity::{entropy_similarity, shifted_entropy_similarity};

/// Errors raised while resolving search parameters. These surface before
/// any spectrum is read or scored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterError {
    #[error("no {0} tolerance was supplied, set either a Da or a ppm window")]
    MissingTolerance(&'static str),
}

/// Resolve a tolerance from its raw Da/ppm settings. A Da value takes
/// precedence when both are supplied.
pub fn resolve_tolerance(
    label: &'static str,
    da: Option<f64>,
    ppm: Option<f64>,
) -> Result<Tolerance, ParameterError> {
    match (da, ppm) {
        (Some(da), _) => Ok(Tolerance::Da(da)),
        (None, Some(ppm)) => Ok(Tolerance::PPM(ppm)),
        (None, None) => Err(ParameterError::MissingTolerance(label)),
    }
}

/// Width in Da of the hybrid bucket indexes for a given MS2 tolerance
/// configuration. A ppm-only configuration falls back to the fixed
/// `ppm * 50e-6` conversion.
pub fn hybrid_bucket_width(
    ms2_da: Option<f64>,
    ms2_ppm: Option<f64>,
) -> Result<f64, ParameterError> {
    match (ms2_da, ms2_ppm) {
        (Some(da), _) => Ok(da),
        (None, Some(ppm)) => Ok(ppm * 50e-6),
        (None, None) => Err(ParameterError::MissingTolerance("MS2")),
    }
}

/// The candidate-retrieval and scoring strategy of a search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SearchKind {
    /// Precursor-window candidates, direct peak matching
    Identity,
    /// Every library entry of the query's polarity, direct peak matching
    Open,
    /// Fragment/neutral-loss bucket candidates, precursor-delta-shifted matching
    Hybrid,
    /// Precursor windows around `mz` and `mz - shift`, shifted matching
    TargetShift { shift: f64 },
}

/// Full parameter set of a search run. Built once, shared read-only by
/// every worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SearchParameters {
    pub kind: SearchKind,
    pub ms1_tolerance: Tolerance,
    pub ms2_tolerance: Tolerance,
    /// Peaks below this fraction of the base peak are treated as noise
    pub noise_fraction: Option<f32>,
    /// Width in Da of the precursor region stripped from query spectra
    pub precursor_removal: Option<f64>,
    /// Matches scoring below this are discarded
    pub score_min: f64,
    /// Keep at most this many matches per query
    pub top_n: Option<usize>,
    /// Clean query peaks before scoring; disable for pre-cleaned input
    pub clean_queries: bool,
}

impl SearchParameters {
    pub fn new(kind: SearchKind, ms1_tolerance: Tolerance, ms2_tolerance: Tolerance) -> Self {
        Self {
            kind,
            ms1_tolerance,
            ms2_tolerance,
            noise_fraction: Some(0.01),
            precursor_removal: Some(1.6),
            score_min: 0.5,
            top_n: Some(100),
            clean_queries: true,
        }
    }

    /// The cleaner applied to query spectra (and, at build time, library
    /// spectra) under these parameters.
    pub fn cleaner(&self) -> PeakCleaner {
        PeakCleaner::new(
            self.ms2_tolerance,
            self.precursor_removal,
            self.noise_fraction,
        )
    }
}

/// One incoming spectrum to search. Queries missing a precursor m/z,
/// polarity, or peaks are not searchable and produce empty results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySpectrum {
    pub scan_id: usize,
    pub precursor_mz: Option<f64>,
    pub polarity: Option<Polarity>,
    pub rt: Option<f64>,
    pub peaks: Vec<CentroidPeak>,
}

impl QuerySpectrum {
    pub fn is_searchable(&self) -> bool {
        self.precursor_mz.map_or(false, |mz| mz > 0.0)
            && self.polarity.is_some()
            && !self.peaks.is_empty()
    }
}

/// A scored correspondence between a query spectrum and a library entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectrumMatch {
    pub scan_id: usize,
    pub library_id: EntryId,
    pub score: f64,
}

fn candidate_ids(
    index: &LibraryIndex,
    kind: SearchKind,
    precursor_mz: f64,
    polarity: Polarity,
    peaks: &[CentroidPeak],
    ms1_tolerance: Tolerance,
) -> Vec<EntryId> {
    match kind {
        SearchKind::Identity => index
            .query_by_precursor(precursor_mz, polarity, ms1_tolerance)
            .to_vec(),
        SearchKind::Open => index.partition_ids(polarity).to_vec(),
        SearchKind::Hybrid => index.query_by_fragments(peaks, precursor_mz, polarity),
        SearchKind::TargetShift { shift } => {
            let mut ids = index
                .query_by_precursor(precursor_mz, polarity, ms1_tolerance)
                .to_vec();
            ids.extend_from_slice(index.query_by_precursor(
                precursor_mz - shift,
                polarity,
                ms1_tolerance,
            ));
            ids.sort_unstable();
            ids.dedup();
            ids
        }
    }
}

/// Search one query spectrum against the library, returning matches at or
/// above the score threshold, best first. An unsearchable query or an empty
/// candidate set yields an empty result.
pub fn search_one(
    query: &QuerySpectrum,
    index: &LibraryIndex,
    params: &SearchParameters,
) -> Vec<SpectrumMatch> {
    if !query.is_searchable() {
        return Vec::new();
    }
    let precursor_mz = query.precursor_mz.unwrap_or_default();
    let polarity = query.polarity.unwrap_or(Polarity::Positive);

    let peaks: PeakList = if params.clean_queries {
        params.cleaner().clean(&query.peaks, Some(precursor_mz))
    } else {
        query.peaks.clone()
    };
    if peaks.is_empty() {
        return Vec::new();
    }

    let candidates = candidate_ids(
        index,
        params.kind,
        precursor_mz,
        polarity,
        &peaks,
        params.ms1_tolerance,
    );
    if candidates.is_empty() {
        return Vec::new();
    }

    let mut matches: Vec<SpectrumMatch> = Vec::new();
    for id in candidates {
        let entry = index.entry(id);
        let score = match params.kind {
            SearchKind::Identity | SearchKind::Open => {
                entropy_similarity(&peaks, &entry.peaks, params.ms2_tolerance)
            }
            SearchKind::Hybrid | SearchKind::TargetShift { .. } => shifted_entropy_similarity(
                &peaks,
                &entry.peaks,
                precursor_mz - entry.precursor_mz,
                params.ms2_tolerance,
            ),
        };
        if score >= params.score_min {
            matches.push(SpectrumMatch {
                scan_id: query.scan_id,
                library_id: id,
                score,
            });
        }
    }

    if let Some(top_n) = params.top_n {
        if top_n == 0 {
            return Vec::new();
        }
        if matches.len() > top_n {
            matches.select_nth_unstable_by(top_n - 1, |a, b| b.score.total_cmp(&a.score));
            matches.truncate(top_n);
        }
    }
    matches.retain(|m| m.score > 0.0);
    matches.sort_by(|a, b| b.score.total_cmp(&a.score));
    matches
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;
    use crate::index::{HybridIndexParams, LibraryBuilder, LibraryEntry};

    fn peaks(raw: &[(f64, f32)]) -> Vec<CentroidPeak> {
        raw.iter()
            .enumerate()
            .map(|(i, (mz, intensity))| CentroidPeak::new(*mz, *intensity, i as u32))
            .collect()
    }

    fn query(scan_id: usize, precursor_mz: f64, raw: &[(f64, f32)]) -> QuerySpectrum {
        QuerySpectrum {
            scan_id,
            precursor_mz: Some(precursor_mz),
            polarity: Some(Polarity::Positive),
            rt: None,
            peaks: peaks(raw),
        }
    }

    fn identity_params() -> SearchParameters {
        SearchParameters::new(
            SearchKind::Identity,
            Tolerance::Da(0.01),
            Tolerance::Da(0.01),
        )
    }

    fn one_entry_library() -> LibraryIndex {
        let mut builder = LibraryBuilder::new();
        builder.add_entry(LibraryEntry::new(
            100.0,
            Polarity::Positive,
            peaks(&[(50.0, 1.0), (60.0, 0.5)]),
            HashMap::new(),
        ));
        builder.build(None, None)
    }

    #[test]
    fn test_resolve_tolerance_precedence() {
        assert!(matches!(
            resolve_tolerance("MS2", Some(0.02), Some(10.0)),
            Ok(Tolerance::Da(da)) if (da - 0.02).abs() < 1e-12
        ));
        assert!(matches!(
            resolve_tolerance("MS2", None, Some(10.0)),
            Ok(Tolerance::PPM(ppm)) if (ppm - 10.0).abs() < 1e-12
        ));
        assert!(matches!(
            resolve_tolerance("MS2", None, None),
            Err(ParameterError::MissingTolerance("MS2"))
        ));
    }

    #[test]
    fn test_hybrid_bucket_width_fallback() {
        assert_eq!(hybrid_bucket_width(Some(0.05), Some(10.0)), Ok(0.05));
        assert_eq!(hybrid_bucket_width(None, Some(10.0)), Ok(10.0 * 50e-6));
        assert!(hybrid_bucket_width(None, None).is_err());
    }

    #[test]
    fn test_identity_search_end_to_end() {
        let index = one_entry_library();
        let params = identity_params();
        let hits = search_one(&query(7, 100.0, &[(50.0, 1.0), (60.0, 0.5)]), &index, &params);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].scan_id, 7);
        assert_eq!(hits[0].library_id, 0);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_search_out_of_window_is_empty() {
        let index = one_entry_library();
        let params = identity_params();
        let hits = search_one(&query(1, 105.0, &[(50.0, 1.0), (60.0, 0.5)]), &index, &params);
        assert!(hits.is_empty());
    }

    #[test]
    fn test_unsearchable_query_is_empty() {
        let index = one_entry_library();
        let params = identity_params();
        let mut q = query(1, 100.0, &[(50.0, 1.0)]);
        q.precursor_mz = None;
        assert!(search_one(&q, &index, &params).is_empty());
        let mut q = query(1, 100.0, &[(50.0, 1.0)]);
        q.polarity = None;
        assert!(search_one(&q, &index, &params).is_empty());
        let q = query(1, 100.0, &[]);
        assert!(search_one(&q, &index, &params).is_empty());
    }

    #[test]
    fn test_score_threshold_filters_matches() {
        let index = one_entry_library();
        let mut params = identity_params();
        params.score_min = 0.99;
        // overlaps on one of two peaks only
        let hits = search_one(&query(1, 100.0, &[(50.0, 1.0), (75.0, 0.5)]), &index, &params);
        assert!(hits.is_empty());
    }

    #[test]
    fn test_top_n_keeps_best_matches() {
        let mut builder = LibraryBuilder::new();
        for i in 0..6 {
            // progressively worse overlap with the query
            let secondary = 60.0 + i as f64;
            builder.add_entry(LibraryEntry::new(
                100.0,
                Polarity::Positive,
                peaks(&[(50.0, 1.0), (secondary, 0.5)]),
                HashMap::new(),
            ));
        }
        let index = builder.build(None, None);
        let mut params = identity_params();
        params.score_min = 0.0;
        params.top_n = Some(2);

        let hits = search_one(&query(1, 100.0, &[(50.0, 1.0), (60.0, 0.5)]), &index, &params);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].library_id, 0);
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn test_target_shift_search_unions_windows() {
        let mut builder = LibraryBuilder::new();
        builder.add_entry(LibraryEntry::new(
            100.0,
            Polarity::Positive,
            peaks(&[(50.0, 1.0), (60.0, 0.5)]),
            HashMap::new(),
        ));
        let index = builder.build(None, None);

        let mut params = identity_params();
        params.kind = SearchKind::TargetShift { shift: 12.0 };
        params.score_min = 0.1;

        // the query precursor sits a full shift above the library entry;
        // its fragments carry the same offset
        let hits = search_one(
            &query(3, 112.0, &[(50.0, 1.0), (72.0, 0.5)]),
            &index,
            &params,
        );
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_hybrid_search_finds_shifted_spectrum() {
        let mut builder = LibraryBuilder::new();
        builder.add_entry(LibraryEntry::new(
            100.0,
            Polarity::Positive,
            peaks(&[(50.0, 1.0), (60.0, 0.5)]),
            HashMap::new(),
        ));
        builder.add_entry(LibraryEntry::new(
            400.0,
            Polarity::Positive,
            peaks(&[(350.0, 1.0)]),
            HashMap::new(),
        ));
        let index = builder.build(None, Some(HybridIndexParams::new(0.01)));

        let mut params = identity_params();
        params.kind = SearchKind::Hybrid;
        params.score_min = 0.1;

        // shares the unshifted fragment at 50.0; the 72.0 fragment only
        // lines up after the precursor delta is applied
        let hits = search_one(
            &query(9, 112.0, &[(50.0, 1.0), (72.0, 0.5)]),
            &index,
            &params,
        );
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].library_id, 0);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_open_search_scans_whole_partition() {
        let mut builder = LibraryBuilder::new();
        builder.add_entry(LibraryEntry::new(
            500.0,
            Polarity::Positive,
            peaks(&[(50.0, 1.0), (60.0, 0.5)]),
            HashMap::new(),
        ));
        let index = builder.build(None, None);

        let mut params = identity_params();
        params.kind = SearchKind::Open;
        params.score_min = 0.5;
        params.precursor_removal = None;

        // precursor far outside any MS1 window still scores in open mode
        let hits = search_one(&query(2, 100.0, &[(50.0, 1.0), (60.0, 0.5)]), &index, &params);
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }
}
