//! Spectrum record ingestion through `mzdata` readers.
//!
//! Records the core cannot use (no precursor, no polarity, no peaks) are
//! skipped with a warning here and never reach the index or the search.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use mzdata::io::MZReaderType;
use mzdata::prelude::*;
use mzdata::spectrum::{MultiLayerSpectrum, ScanPolarity, SignalContinuity};
use mzpeaks::{CentroidPeak, DeconvolutedPeak};
use tracing::{debug, warn};

use mzentropy::{LibraryEntry, Polarity, QuerySpectrum};

pub(crate) type SpectrumType = MultiLayerSpectrum<CentroidPeak, DeconvolutedPeak>;
type ReaderType = MZReaderType<std::fs::File, CentroidPeak, DeconvolutedPeak>;

fn centroids_of(spectrum: &mut SpectrumType) -> Option<Vec<CentroidPeak>> {
    match spectrum.signal_continuity() {
        SignalContinuity::Profile => {
            spectrum.pick_peaks(1.0).ok()?;
            spectrum
                .peaks
                .as_ref()
                .map(|peaks| peaks.iter().cloned().collect())
        }
        _ => spectrum
            .try_build_centroids()
            .ok()
            .map(|peaks| peaks.iter().cloned().collect()),
    }
}

fn polarity_of(spectrum: &SpectrumType, charge_override: Option<Polarity>) -> Option<Polarity> {
    if let Some(polarity) = charge_override {
        return Some(polarity);
    }
    match spectrum.polarity() {
        ScanPolarity::Positive => Some(Polarity::Positive),
        ScanPolarity::Negative => Some(Polarity::Negative),
        ScanPolarity::Unknown => spectrum
            .precursor()
            .and_then(|prec| prec.ion().and_then(|ion| ion.charge))
            .and_then(Polarity::from_charge),
    }
}

fn precursor_mz_of(spectrum: &SpectrumType) -> Option<f64> {
    spectrum.precursor().and_then(|prec| prec.ion().map(|ion| ion.mz))
}

/// Read the MSn spectra of one library file as index entries, skipping
/// records without a usable precursor, polarity, or peak list.
pub(crate) fn read_library_entries(
    path: &Path,
    charge_override: Option<Polarity>,
) -> io::Result<Vec<LibraryEntry>> {
    let mut reader: ReaderType = MZReaderType::open_path(path)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut entries = Vec::new();
    let mut skipped = 0usize;
    for mut spectrum in reader.iter() {
        if spectrum.ms_level() < 2 {
            continue;
        }
        let Some(precursor_mz) = precursor_mz_of(&spectrum).filter(|mz| *mz > 0.0) else {
            skipped += 1;
            continue;
        };
        let Some(polarity) = polarity_of(&spectrum, charge_override) else {
            skipped += 1;
            continue;
        };
        let Some(peaks) = centroids_of(&mut spectrum).filter(|peaks| !peaks.is_empty()) else {
            skipped += 1;
            continue;
        };

        let mut metadata = HashMap::new();
        metadata.insert("name".to_string(), spectrum.id().to_string());
        metadata.insert("file".to_string(), file_name.clone());
        if let Some(charge) = spectrum.precursor().and_then(|prec| prec.ion().and_then(|ion| ion.charge)) {
            metadata.insert("charge".to_string(), charge.to_string());
        }
        entries.push(LibraryEntry::new(precursor_mz, polarity, peaks, metadata));
    }

    if skipped > 0 {
        warn!(
            "Skipped {skipped} unusable spectra while reading {}",
            path.display()
        );
    }
    debug!("Read {} library spectra from {}", entries.len(), path.display());
    Ok(entries)
}

/// Read the MSn spectra of a query file. Spectra the engine cannot search
/// are kept so they appear in the result stream with no matches.
pub(crate) fn read_query_spectra(
    path: &Path,
    charge_override: Option<Polarity>,
) -> io::Result<Vec<QuerySpectrum>> {
    let mut reader: ReaderType = MZReaderType::open_path(path)?;

    let mut queries = Vec::new();
    for mut spectrum in reader.iter() {
        if spectrum.ms_level() < 2 {
            continue;
        }
        let scan_id = spectrum.index();
        let precursor_mz = precursor_mz_of(&spectrum);
        let polarity = polarity_of(&spectrum, charge_override);
        let rt = Some(spectrum.acquisition().start_time());
        let peaks = centroids_of(&mut spectrum).unwrap_or_default();
        queries.push(QuerySpectrum {
            scan_id,
            precursor_mz,
            polarity,
            rt,
            peaks,
        });
    }
    debug!("Read {} query spectra from {}", queries.len(), path.display());
    Ok(queries)
}
