//! The precursor-sorted, polarity-partitioned spectral library index.
//!
//! Building happens in two phases: entries are first accumulated with
//! stable global ids assigned in insertion order, then every derived
//! structure (the per-polarity sorted precursor arrays and the optional
//! fragment/neutral-loss bucket indexes) is produced in a single pass.
//! Ids are never renumbered afterwards, and the built index is immutable,
//! so it can be shared freely across search workers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use mzpeaks::{CentroidPeak, Tolerance};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::peaks::PeakCleaner;

/// Stable identifier of a library entry, assigned at accumulation time.
pub type EntryId = u32;

/// Ion mode of a spectrum. Library partitions are keyed on this, so a query
/// is only ever compared against references acquired in the same mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarity {
    Positive,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized polarity token {0:?}")]
pub struct PolarityParseError(pub String);

impl Polarity {
    /// The sign of a numeric charge state.
    pub fn from_charge(charge: i32) -> Option<Polarity> {
        match charge.signum() {
            1 => Some(Polarity::Positive),
            -1 => Some(Polarity::Negative),
            _ => None,
        }
    }

    /// The trailing sign of an adduct token like `[M+H]+`.
    pub fn from_adduct(adduct: &str) -> Option<Polarity> {
        match adduct.chars().last() {
            Some('+') => Some(Polarity::Positive),
            Some('-') => Some(Polarity::Negative),
            _ => None,
        }
    }
}

impl FromStr for Polarity {
    type Err = PolarityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "+" | "positive" | "pos" | "1" => Ok(Polarity::Positive),
            "-" | "negative" | "neg" | "-1" => Ok(Polarity::Negative),
            _ => Err(PolarityParseError(s.to_string())),
        }
    }
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Polarity::Positive => write!(f, "+"),
            Polarity::Negative => write!(f, "-"),
        }
    }
}

/// A reference spectrum with its descriptive metadata. Owned by the
/// [`LibraryIndex`] once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub precursor_mz: f64,
    pub polarity: Polarity,
    pub peaks: Vec<CentroidPeak>,
    pub metadata: HashMap<String, String>,
}

impl LibraryEntry {
    pub fn new(
        precursor_mz: f64,
        polarity: Polarity,
        peaks: Vec<CentroidPeak>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            precursor_mz,
            polarity,
            peaks,
            metadata,
        }
    }
}

/// Default intensity floor for peaks admitted to the bucket indexes
pub const DEFAULT_MIN_INDEXED_INTENSITY: f32 = 0.05;
/// Default cap on the number of peaks per entry admitted to the bucket indexes
pub const DEFAULT_MAX_INDEXED_PEAKS: usize = 10;

/// Construction parameters of the fragment and neutral-loss bucket indexes.
///
/// Only an entry's `max_peak_number` most intense peaks above
/// `min_intensity` are indexed. That keeps the buckets small at the cost of
/// recall for weak fragments, which the scoring stage never sees anyway.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HybridIndexParams {
    /// Bucket width in Da, normally the MS2 tolerance
    pub bucket_width: f64,
    pub min_intensity: f32,
    pub max_peak_number: usize,
}

impl HybridIndexParams {
    pub fn new(bucket_width: f64) -> Self {
        Self {
            bucket_width,
            min_intensity: DEFAULT_MIN_INDEXED_INTENSITY,
            max_peak_number: DEFAULT_MAX_INDEXED_PEAKS,
        }
    }
}

/// An inverted index from `floor(mz / width)` buckets to entry id sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketIndex {
    width: f64,
    buckets: Vec<HashSet<EntryId>>,
}

impl BucketIndex {
    fn new(width: f64) -> Self {
        Self {
            width,
            buckets: Vec::new(),
        }
    }

    fn bucket_of(&self, mz: f64) -> Option<usize> {
        if mz < 0.0 || self.width <= 0.0 {
            return None;
        }
        Some((mz / self.width).floor() as usize)
    }

    fn insert(&mut self, mz: f64, id: EntryId) {
        let Some(bucket) = self.bucket_of(mz) else {
            return;
        };
        if bucket >= self.buckets.len() {
            self.buckets.resize_with(bucket + 1, HashSet::new);
        }
        self.buckets[bucket].insert(id);
    }

    /// Gather the entries of the bucket holding `mz` and both neighboring
    /// buckets, tolerating boundary rounding. Out-of-range buckets are
    /// silently empty.
    fn collect_near(&self, mz: f64, into: &mut HashSet<EntryId>) {
        let Some(bucket) = self.bucket_of(mz) else {
            return;
        };
        for neighbor in bucket.saturating_sub(1)..=bucket + 1 {
            if let Some(members) = self.buckets.get(neighbor) {
                into.extend(members.iter().copied());
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Partition {
    /// Entry ids sorted ascending by precursor m/z
    order: Vec<EntryId>,
    /// Precursor m/z values parallel to `order`
    precursor_mzs: Vec<f64>,
    fragment_index: Option<BucketIndex>,
    neutral_loss_index: Option<BucketIndex>,
}

impl Partition {
    fn range_query(&self, mz_min: f64, mz_max: f64) -> &[EntryId] {
        let left = self.precursor_mzs.partition_point(|mz| *mz < mz_min);
        let right = self.precursor_mzs.partition_point(|mz| *mz <= mz_max);
        &self.order[left..right]
    }
}

fn select_indexed_peaks(
    peaks: &[CentroidPeak],
    min_intensity: f32,
    max_peak_number: usize,
) -> Vec<CentroidPeak> {
    let mut selected: Vec<CentroidPeak> = peaks
        .iter()
        .filter(|p| p.intensity > min_intensity)
        .cloned()
        .collect();
    if selected.len() > max_peak_number {
        selected.sort_by(|a, b| b.intensity.total_cmp(&a.intensity));
        selected.truncate(max_peak_number);
    }
    selected
}

fn build_partition(
    entries: &[LibraryEntry],
    polarity: Polarity,
    hybrid: Option<HybridIndexParams>,
) -> Partition {
    let mut members: Vec<(f64, EntryId)> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.polarity == polarity)
        .map(|(id, e)| (e.precursor_mz, id as EntryId))
        .collect();
    members.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut partition = Partition {
        precursor_mzs: members.iter().map(|(mz, _)| *mz).collect(),
        order: members.iter().map(|(_, id)| *id).collect(),
        ..Partition::default()
    };

    if let Some(params) = hybrid {
        let mut fragment_index = BucketIndex::new(params.bucket_width);
        let mut neutral_loss_index = BucketIndex::new(params.bucket_width);
        for &id in &partition.order {
            let entry = &entries[id as usize];
            if entry.peaks.is_empty() {
                continue;
            }
            for peak in
                select_indexed_peaks(&entry.peaks, params.min_intensity, params.max_peak_number)
            {
                fragment_index.insert(peak.mz, id);
                neutral_loss_index.insert(entry.precursor_mz - peak.mz, id);
            }
        }
        partition.fragment_index = Some(fragment_index);
        partition.neutral_loss_index = Some(neutral_loss_index);
    }

    partition
}

/// Accumulates library entries ahead of index construction.
///
/// Any number of library files may be merged into one builder; the id
/// handed back by [`LibraryBuilder::add_entry`] stays valid in the built
/// index.
#[derive(Debug, Default)]
pub struct LibraryBuilder {
    entries: Vec<LibraryEntry>,
}

impl LibraryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add_entry(&mut self, entry: LibraryEntry) -> EntryId {
        let id = self.entries.len() as EntryId;
        self.entries.push(entry);
        id
    }

    /// Build the derived indexes. When a `cleaner` is supplied every
    /// entry's peaks are cleaned first; pass `None` for libraries whose
    /// peaks are already centroided and normalized. Entries left with no
    /// peaks stay in the index and simply never score.
    pub fn build(
        self,
        cleaner: Option<&PeakCleaner>,
        hybrid: Option<HybridIndexParams>,
    ) -> LibraryIndex {
        let mut entries = self.entries;
        if let Some(cleaner) = cleaner {
            entries
                .par_iter_mut()
                .for_each(|entry| entry.peaks = cleaner.clean(&entry.peaks, Some(entry.precursor_mz)));
        }

        let positive = build_partition(&entries, Polarity::Positive, hybrid);
        let negative = build_partition(&entries, Polarity::Negative, hybrid);
        debug!(
            "Indexed {} library entries ({} positive, {} negative)",
            entries.len(),
            positive.order.len(),
            negative.order.len()
        );

        LibraryIndex {
            entries,
            positive,
            negative,
            hybrid_params: hybrid,
        }
    }
}

/// The built, read-only library index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryIndex {
    entries: Vec<LibraryEntry>,
    positive: Partition,
    negative: Partition,
    hybrid_params: Option<HybridIndexParams>,
}

impl LibraryIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, id: EntryId) -> &LibraryEntry {
        &self.entries[id as usize]
    }

    pub fn entries(&self) -> &[LibraryEntry] {
        &self.entries
    }

    pub fn hybrid_params(&self) -> Option<HybridIndexParams> {
        self.hybrid_params
    }

    fn partition(&self, polarity: Polarity) -> &Partition {
        match polarity {
            Polarity::Positive => &self.positive,
            Polarity::Negative => &self.negative,
        }
    }

    /// Every entry id in one polarity partition, ascending by precursor m/z.
    pub fn partition_ids(&self, polarity: Polarity) -> &[EntryId] {
        &self.partition(polarity).order
    }

    /// Entries whose precursor m/z lies within `tolerance` of `mz`.
    /// An empty window is an empty result, never an error.
    pub fn query_by_precursor(
        &self,
        mz: f64,
        polarity: Polarity,
        tolerance: Tolerance,
    ) -> &[EntryId] {
        let (low, high) = tolerance.bounds(mz);
        self.partition(polarity).range_query(low, high)
    }

    /// Candidate entries sharing an indexed fragment or neutral loss with
    /// the query, selected with the same top-K rule the buckets were built
    /// with. Returns ids deduplicated and in ascending order.
    pub fn query_by_fragments(
        &self,
        peaks: &[CentroidPeak],
        precursor_mz: f64,
        polarity: Polarity,
    ) -> Vec<EntryId> {
        let Some(params) = self.hybrid_params else {
            warn!("Fragment query against an index built without bucket indexes");
            return Vec::new();
        };
        let partition = self.partition(polarity);
        let mut found: HashSet<EntryId> = HashSet::new();
        for peak in select_indexed_peaks(peaks, params.min_intensity, params.max_peak_number) {
            if let Some(index) = partition.fragment_index.as_ref() {
                index.collect_near(peak.mz, &mut found);
            }
            if let Some(index) = partition.neutral_loss_index.as_ref() {
                index.collect_near(precursor_mz - peak.mz, &mut found);
            }
        }
        let mut candidates: Vec<EntryId> = found.into_iter().collect();
        candidates.sort_unstable();
        candidates
    }
}
