use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the notebook pipeline.
///
/// Nothing in this crate retries or recovers locally; every failure is
/// propagated to the caller identifying the stage that failed.
#[derive(Debug, Error)]
pub enum Error {
    /// The notebook file could not be read from disk.
    #[error("failed to read notebook {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file was read but is not a valid nbformat document.
    #[error("invalid notebook document {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A code cell raised during execution and errors were not allowed.
    #[error("cell execution failed: {ename}: {evalue}")]
    Execution {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },

    /// The execution deadline elapsed before all cells finished.
    #[error("notebook execution timed out after {0:?}")]
    Timeout(Duration),

    /// The embedded interpreter itself failed (not a cell-level error).
    #[error("python interpreter error: {0}")]
    Interpreter(#[from] pyo3::PyErr),

    /// The conversion engine could not render an output.
    #[error("markdown conversion failed: {0}")]
    Conversion(String),

    /// An output replacement pattern did not compile.
    #[error("invalid output replacement pattern {pattern:?}: {source}")]
    Replacement {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The exported file or one of its resources could not be written.
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
