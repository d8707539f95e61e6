//! On-disk persistence of the built library index.
//!
//! The cache is a MessagePack blob holding the serialized build
//! configuration next to the index itself. Loading compares the stored
//! configuration bytes against the current one and rebuilds on any
//! difference, so a changed tolerance, cleaning setting, or library file
//! silently invalidates the cache.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use mzpeaks::Tolerance;
use serde::Serialize;
use tracing::{debug, warn};

use mzentropy::{HybridIndexParams, LibraryIndex, SearchParameters};

pub(crate) const INDEX_CACHE_VERSION: u32 = 1;

/// Everything the stored index depends on. Serialized, never compared
/// field by field.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct CacheKey {
    version: u32,
    ms2_tolerance: Tolerance,
    noise_fraction: Option<f32>,
    precursor_removal: Option<f64>,
    clean_spectra: bool,
    hybrid: Option<HybridIndexParams>,
    library_files: Vec<(String, u64)>,
}

impl CacheKey {
    pub(crate) fn new(
        params: &SearchParameters,
        clean_spectra: bool,
        hybrid: Option<HybridIndexParams>,
        library: &[PathBuf],
    ) -> io::Result<Self> {
        let mut library_files = Vec::with_capacity(library.len());
        for path in library {
            let size = fs::metadata(path)?.len();
            library_files.push((path.to_string_lossy().to_string(), size));
        }
        Ok(Self {
            version: INDEX_CACHE_VERSION,
            ms2_tolerance: params.ms2_tolerance,
            noise_fraction: params.noise_fraction,
            precursor_removal: params.precursor_removal,
            clean_spectra,
            hybrid,
            library_files,
        })
    }

    fn fingerprint(&self) -> Option<Vec<u8>> {
        rmp_serde::to_vec(self).ok()
    }
}

/// Load a cached index if the blob exists, decodes, and was built under
/// exactly the configuration described by `key`.
pub(crate) fn load_index(path: &Path, key: &CacheKey) -> Option<LibraryIndex> {
    let bytes = fs::read(path).ok()?;
    let (stored, index): (Vec<u8>, LibraryIndex) = match rmp_serde::from_slice(&bytes) {
        Ok(decoded) => decoded,
        Err(cause) => {
            warn!(
                "Discarding unreadable index cache {}: {cause}",
                path.display()
            );
            return None;
        }
    };
    if Some(stored) != key.fingerprint() {
        debug!(
            "Index cache {} does not match the current configuration, rebuilding",
            path.display()
        );
        return None;
    }
    Some(index)
}

pub(crate) fn save_index(path: &Path, key: &CacheKey, index: &LibraryIndex) -> io::Result<()> {
    let fingerprint = key
        .fingerprint()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unserializable cache key"))?;
    let blob = rmp_serde::to_vec(&(fingerprint, index))
        .map_err(|cause| io::Error::new(io::ErrorKind::InvalidData, cause))?;
    fs::write(path, blob)
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use mzentropy::{LibraryBuilder, LibraryEntry, Polarity, SearchKind};
    use mzpeaks::CentroidPeak;

    use super::*;

    fn params() -> SearchParameters {
        SearchParameters::new(
            SearchKind::Identity,
            Tolerance::Da(0.01),
            Tolerance::Da(0.02),
        )
    }

    fn index() -> LibraryIndex {
        let mut builder = LibraryBuilder::new();
        builder.add_entry(LibraryEntry::new(
            100.0,
            Polarity::Positive,
            vec![CentroidPeak::new(50.0, 1.0, 0)],
            HashMap::new(),
        ));
        builder.build(None, None)
    }

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("mzsearcher-cache-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_cache_round_trip() {
        let path = scratch_path("round-trip.idx");
        let key = CacheKey::new(&params(), true, None, &[]).unwrap();
        let index = index();
        save_index(&path, &key, &index).unwrap();

        let loaded = load_index(&path, &key).expect("cache should load");
        assert_eq!(loaded.len(), index.len());
        assert!(
            (loaded.entry(0).precursor_mz - index.entry(0).precursor_mz).abs() < 1e-9
        );
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_cache_rejects_changed_parameters() {
        let path = scratch_path("stale.idx");
        let key = CacheKey::new(&params(), true, None, &[]).unwrap();
        save_index(&path, &key, &index()).unwrap();

        let mut changed = params();
        changed.ms2_tolerance = Tolerance::Da(0.05);
        let other = CacheKey::new(&changed, true, None, &[]).unwrap();
        assert!(load_index(&path, &other).is_none());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_cache_missing_file_is_none() {
        let key = CacheKey::new(&params(), true, None, &[]).unwrap();
        assert!(load_index(Path::new("does-not-exist.idx"), &key).is_none());
    }
}
