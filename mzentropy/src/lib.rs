pub mod index;
pub mod matching;
pub mod peaks;
pub mod pool;
pub mod search;
pub mod similarity;

pub use crate::index::{
    EntryId, HybridIndexParams, LibraryBuilder, LibraryEntry, LibraryIndex, Polarity,
};
pub use crate::peaks::PeakCleaner;
pub use crate::pool::{search_batch, JobOutcome, SearchPool, SearchStatus, StatusHandle};
pub use crate::search::{
    search_one, ParameterError, QuerySpectrum, SearchKind, SearchParameters, SpectrumMatch,
};
