use std::path::PathBuf;
use thiserror::Error;

/// Structured failures for file-based pipeline stages.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Missing input file: {path} (produced by an earlier stage; rerun it first)")]
    MissingInput { path: PathBuf },
    #[error("Malformed table {path} at line {line}: {reason}")]
    MalformedTable {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("Grid file {path} has ragged rows: expected {expected} columns, found {found}")]
    RaggedGrid {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
}
