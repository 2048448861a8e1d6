//! Error taxonomy for transformation stages.
//!
//! Fatal conditions that must stop a run before anything is published are
//! modelled here. Data-quality findings with a well-defined fallback (nulls,
//! unresolved joins) are never errors; they are recorded in
//! [`crate::enforce::ViolationReport`] and the run continues.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unknown source '{0}': no descriptor is registered in the catalog")]
    UnknownSource(String),

    #[error(
        "Ambiguous join key in relation '{relation}': value '{value}' of column(s) '{column}' occurs {occurrences} times"
    )]
    AmbiguousJoinKey {
        relation: String,
        column: String,
        value: String,
        occurrences: usize,
    },

    #[error("Invalid timestamp '{value}' in column '{column}' at record {row}")]
    InvalidTimestamp {
        column: String,
        row: usize,
        value: String,
    },

    #[error("Column '{column}' not found in dataset '{dataset}'")]
    UnknownColumn { dataset: String, column: String },

    #[error("Reducer '{reducer}' cannot be applied to column '{column}' of type {datatype}")]
    IncompatibleReducer {
        reducer: String,
        column: String,
        datatype: String,
    },

    #[error("Numeric overflow accumulating column '{column}'")]
    NumericOverflow { column: String },

    #[error("Run cancelled before publication")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineError {
    pub fn unknown_column(dataset: impl Into<String>, column: impl Into<String>) -> Self {
        PipelineError::UnknownColumn {
            dataset: dataset.into(),
            column: column.into(),
        }
    }
}
