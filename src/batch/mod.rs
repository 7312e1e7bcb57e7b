pub mod artifacts;
pub mod record;

use thiserror::Error;

pub use record::{Batch, Record};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("required column '{0}' is missing from the header")]
    MissingColumn(String),

    #[error("failed to write CSV: {0}")]
    Write(String),
}

/// Final path segment of an artifact key without its extension
pub fn artifact_stem(name: &str) -> &str {
    let file = name.rsplit('/').next().unwrap_or(name);
    file.strip_suffix(".csv").unwrap_or(file)
}
