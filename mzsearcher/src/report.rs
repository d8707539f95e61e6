//! CSV result reporting.

use std::collections::HashMap;
use std::io;

use serde::Serialize;

use mzentropy::{LibraryIndex, SpectrumMatch};

/// Query-side descriptive fields carried into the report.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueryInfo {
    pub precursor_mz: Option<f64>,
    pub rt: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ResultRow<'a> {
    query_scan: usize,
    query_precursor_mz: Option<f64>,
    query_rt: Option<f64>,
    rank: usize,
    library_id: u32,
    library_name: &'a str,
    library_file: &'a str,
    library_precursor_mz: f64,
    score: f64,
}

/// Write one row per (query, match) pair, queries in scan order, matches
/// best first.
pub(crate) fn write_results<W: io::Write>(
    writer: W,
    results: &[(usize, Vec<SpectrumMatch>)],
    queries: &HashMap<usize, QueryInfo>,
    index: &LibraryIndex,
) -> csv::Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    for (scan_id, matches) in results {
        let info = queries.get(scan_id);
        for (rank, hit) in matches.iter().enumerate() {
            let entry = index.entry(hit.library_id);
            writer.serialize(ResultRow {
                query_scan: *scan_id,
                query_precursor_mz: info.and_then(|i| i.precursor_mz),
                query_rt: info.and_then(|i| i.rt),
                rank: rank + 1,
                library_id: hit.library_id,
                library_name: entry
                    .metadata
                    .get("name")
                    .map(String::as_str)
                    .unwrap_or_default(),
                library_file: entry
                    .metadata
                    .get("file")
                    .map(String::as_str)
                    .unwrap_or_default(),
                library_precursor_mz: entry.precursor_mz,
                score: hit.score,
            })?;
        }
    }
    writer.flush()?;
    Ok(())
}
