mod args;
mod cache;
mod driver;
mod reader;
mod report;

pub use args::SearchTypeArg;
pub use driver::{MZSearcher, MZSearcherError};
