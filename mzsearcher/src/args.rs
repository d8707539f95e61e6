use clap::ValueEnum;

use mzentropy::SearchKind;

/// The search strategy selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SearchTypeArg {
    /// Match candidates within the MS1 precursor window
    Identity,
    /// Match every library spectrum of the query's polarity
    Open,
    /// Retrieve candidates by shared fragments or neutral losses and
    /// score with precursor-delta-shifted matching
    Hybrid,
    /// Match candidates around the precursor and around a fixed mass
    /// shift below it
    Shift,
}

impl SearchTypeArg {
    pub fn to_kind(self, shift: f64) -> SearchKind {
        match self {
            SearchTypeArg::Identity => SearchKind::Identity,
            SearchTypeArg::Open => SearchKind::Open,
            SearchTypeArg::Hybrid => SearchKind::Hybrid,
            SearchTypeArg::Shift => SearchKind::TargetShift { shift },
        }
    }
}

pub fn non_negative_float_f32(s: &str) -> Result<f32, String> {
    let value = s.parse::<f32>().map_err(|e| e.to_string())?;
    if value < 0.0 {
        Err(format!("`{s}` is less than zero"))
    } else {
        Ok(value)
    }
}

pub fn non_negative_float_f64(s: &str) -> Result<f64, String> {
    let value = s.parse::<f64>().map_err(|e| e.to_string())?;
    if value < 0.0 {
        Err(format!("`{s}` is less than zero"))
    } else {
        Ok(value)
    }
}
