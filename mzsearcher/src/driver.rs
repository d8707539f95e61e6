use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::Parser;
use itertools::Itertools;
use thiserror::Error;
use tracing::{debug, info};

use mzpeaks::Tolerance;

use mzentropy::search::{hybrid_bucket_width, resolve_tolerance};
use mzentropy::{
    search_batch, HybridIndexParams, LibraryBuilder, LibraryIndex, ParameterError, Polarity,
    SearchKind, SearchParameters, StatusHandle,
};

use crate::args::{non_negative_float_f32, non_negative_float_f64, SearchTypeArg};
use crate::cache::{self, CacheKey};
use crate::reader::{read_library_entries, read_query_spectra};
use crate::report::{write_results, QueryInfo};

#[derive(Debug, Error)]
pub enum MZSearcherError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("{0}")]
    ParameterError(
        #[source]
        #[from]
        ParameterError,
    ),
    #[error("Failed to write results: {0}")]
    CsvError(
        #[source]
        #[from]
        csv::Error,
    ),
}

/// Entropy-based spectral library search of mass spectrometry files.
///
/// Read a spectral library and a query file, score each query spectrum
/// against the candidate library spectra, and write the ranked matches as
/// CSV.
#[derive(Parser, Debug)]
#[command(author, version)]
pub struct MZSearcher {
    /// The path to read query spectra from (mzML or MGF)
    #[arg()]
    pub query_file: PathBuf,

    /// A spectral library file (mzML or MGF). Repeat to merge several
    /// libraries into one index.
    #[arg(short = 'l', long = "library", required = true)]
    pub library: Vec<PathBuf>,

    /// The path to write the CSV report to, or '-' for STDOUT
    #[arg(short = 'o', long = "output-file", default_value = "-")]
    pub output_file: PathBuf,

    /// The search strategy to use
    #[arg(short = 's', long = "search-type", value_enum, default_value = "identity")]
    pub search_type: SearchTypeArg,

    /// The precursor mass shift in Da probed by the 'shift' search type
    #[arg(long = "shift", default_value_t = 0.0, allow_negative_numbers = true)]
    pub shift: f64,

    /// The MS1 precursor window in Da. Takes precedence over --ms1-ppm.
    #[arg(long = "ms1-da")]
    pub ms1_da: Option<f64>,

    /// The MS1 precursor window in ppm
    #[arg(long = "ms1-ppm")]
    pub ms1_ppm: Option<f64>,

    /// The MS2 fragment window in Da. Takes precedence over --ms2-ppm.
    #[arg(long = "ms2-da")]
    pub ms2_da: Option<f64>,

    /// The MS2 fragment window in ppm
    #[arg(long = "ms2-ppm")]
    pub ms2_ppm: Option<f64>,

    /// Drop peaks below this fraction of the base peak. 0 disables the
    /// noise filter.
    #[arg(short = 'n', long = "noise", default_value_t = 0.01, value_parser = non_negative_float_f32)]
    pub noise: f32,

    /// Strip peaks within this many Da below the precursor m/z. 0 keeps
    /// the precursor region.
    #[arg(long = "precursor-removal", default_value_t = 1.6, value_parser = non_negative_float_f64)]
    pub precursor_removal: f64,

    /// The minimum similarity score reported
    #[arg(long = "score-min", default_value_t = 0.5)]
    pub score_min: f64,

    /// Keep at most this many matches per query. 0 keeps them all.
    #[arg(long = "top-n", default_value_t = 100)]
    pub top_n: usize,

    /// Skip spectrum cleaning for libraries and queries that are already
    /// centroided and normalized
    #[arg(long = "no-clean")]
    pub no_clean: bool,

    /// Force the polarity of every query and library spectrum instead of
    /// reading it from the file ('+', '-', or a signed charge)
    #[arg(short = 'c', long = "charge", value_parser = Polarity::from_str, allow_hyphen_values = true)]
    pub charge: Option<Polarity>,

    /// Cache the built library index at this path and reuse it on later
    /// runs with the same configuration
    #[arg(long = "index-cache")]
    pub index_cache: Option<PathBuf>,

    /// Rebuild the library index even when a cache matches
    #[arg(long = "rebuild-index")]
    pub rebuild_index: bool,

    /// The number of search workers, passing a value < 1 to use all
    /// available threads
    #[arg(short = 't', long = "threads", default_value_t = -1)]
    pub threads: i32,
}

impl MZSearcher {
    fn worker_count(&self) -> usize {
        if self.threads > 0 {
            self.threads as usize
        } else {
            thread::available_parallelism().map(usize::from).unwrap_or(1)
        }
    }

    fn resolve_parameters(
        &self,
    ) -> Result<(SearchParameters, Option<HybridIndexParams>), ParameterError> {
        let kind = self.search_type.to_kind(self.shift);
        let ms2_tolerance = resolve_tolerance("MS2", self.ms2_da, self.ms2_ppm)?;
        let ms1_tolerance = match kind {
            SearchKind::Identity | SearchKind::TargetShift { .. } => {
                resolve_tolerance("MS1", self.ms1_da, self.ms1_ppm)?
            }
            // open and hybrid retrieval never consult the precursor window
            _ => resolve_tolerance("MS1", self.ms1_da, self.ms1_ppm)
                .unwrap_or(Tolerance::Da(0.01)),
        };

        let mut params = SearchParameters::new(kind, ms1_tolerance, ms2_tolerance);
        params.noise_fraction = (self.noise > 0.0).then_some(self.noise);
        params.precursor_removal = (self.precursor_removal > 0.0).then_some(self.precursor_removal);
        params.score_min = self.score_min;
        params.top_n = (self.top_n > 0).then_some(self.top_n);
        params.clean_queries = !self.no_clean;

        let hybrid = if matches!(kind, SearchKind::Hybrid) {
            Some(hybrid_bucket_width(self.ms2_da, self.ms2_ppm).map(HybridIndexParams::new)?)
        } else {
            None
        };
        Ok((params, hybrid))
    }

    fn load_or_build_index(
        &self,
        params: &SearchParameters,
        hybrid: Option<HybridIndexParams>,
    ) -> Result<LibraryIndex, MZSearcherError> {
        let key = CacheKey::new(params, !self.no_clean, hybrid, &self.library)?;
        if let Some(cache_path) = &self.index_cache {
            if !self.rebuild_index && cache_path.exists() {
                if let Some(index) = cache::load_index(cache_path, &key) {
                    info!(
                        "Loaded an index of {} spectra from {}",
                        index.len(),
                        cache_path.display()
                    );
                    return Ok(index);
                }
            }
        }

        let mut builder = LibraryBuilder::new();
        for path in &self.library {
            let entries = read_library_entries(path, self.charge)?;
            info!("Read {} spectra from {}", entries.len(), path.display());
            for entry in entries {
                builder.add_entry(entry);
            }
        }
        let cleaner = params.cleaner();
        let index = builder.build((!self.no_clean).then_some(&cleaner), hybrid);
        info!("Indexed {} library spectra", index.len());

        if let Some(cache_path) = &self.index_cache {
            cache::save_index(cache_path, &key, &index)?;
            debug!("Saved the index cache to {}", cache_path.display());
        }
        Ok(index)
    }

    pub fn main(&self) -> Result<(), MZSearcherError> {
        info!(
            "mzsearcher v{}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
        );
        info!(
            "Library: {}",
            self.library.iter().map(|p| p.display()).join(", ")
        );
        info!("Query: {}", self.query_file.display());
        info!("Output: {}", self.output_file.display());

        let (params, hybrid) = self.resolve_parameters()?;
        debug!(
            "Parameters: {}",
            serde_json::to_string(&params).unwrap_or_default()
        );

        let started = Instant::now();
        let index = self.load_or_build_index(&params, hybrid)?;

        let queries = read_query_spectra(&self.query_file, self.charge)?;
        let query_count = queries.len();
        let query_info: HashMap<usize, QueryInfo> = queries
            .iter()
            .map(|q| {
                (
                    q.scan_id,
                    QueryInfo {
                        precursor_mz: q.precursor_mz,
                        rt: q.rt,
                    },
                )
            })
            .collect();

        let status = StatusHandle::new();
        let index = Arc::new(index);
        let results = search_batch(
            queries,
            Arc::clone(&index),
            Arc::new(params),
            self.worker_count(),
            &status,
        );

        if self.output_file == PathBuf::from("-") {
            write_results(io::stdout().lock(), &results, &query_info, &index)?;
        } else {
            let handle = io::BufWriter::new(fs::File::create(&self.output_file)?);
            write_results(handle, &results, &query_info, &index)?;
        }

        let with_matches = results.iter().filter(|(_, m)| !m.is_empty()).count();
        let total_matches: usize = results.iter().map(|(_, m)| m.len()).sum();
        info!("Queries Searched: {query_count}");
        info!("Queries With Matches: {with_matches}");
        info!("Total Matches: {total_matches}");
        info!("Total Elapsed Time: {:0.3?}", started.elapsed());
        Ok(())
    }
}
