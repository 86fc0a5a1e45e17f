use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = CadenceError> = std::result::Result<T, E>;

/// Fault raised inside the numerical filtering routine itself, as opposed to
/// a bad parameter handed to it.
#[derive(Debug, Error, PartialEq)]
pub enum FilterFault {
    #[error("signal of {len} samples is not longer than the {padlen}-sample edge padding")]
    PaddingExceedsSignal { len: usize, padlen: usize },
    #[error("filter design did not return second-order sections")]
    NotSecondOrderSections,
    #[error("filter produced a non-finite value at sample {index}")]
    NonFiniteOutput { index: usize },
}

#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("invalid filter parameters: {0}")]
    InvalidFilterParameters(String),

    #[error("{kind} filter failed")]
    FilterExecution {
        kind: &'static str,
        #[source]
        source: FilterFault,
    },

    #[error("{}: missing column {column}", path.display())]
    MissingColumn { path: PathBuf, column: String },

    #[error("unrecognised timestamp {0:?}")]
    InvalidTimestamp(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Parquet(#[from] polars::error::PolarsError),

    #[error(transparent)]
    Gpx(#[from] gpx::errors::GpxError),

    #[error(transparent)]
    Xml(#[from] xml::reader::Error),
}
