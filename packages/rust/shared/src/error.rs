//! Error types for spamflow.
//!
//! Library crates use [`SpamflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all spamflow operations.
///
/// The first five variants are the stage failure taxonomy; a stage that hits
/// any of them fails fast and leaves no outputs behind.
#[derive(Debug, thiserror::Error)]
pub enum SpamflowError {
    /// A declared input file does not exist.
    #[error("input missing: {path:?}")]
    InputMissing { path: PathBuf },

    /// A row in a tabular input could not be parsed or failed validation.
    #[error("malformed row in {path:?} at line {line}: {message}")]
    MalformedRow {
        path: PathBuf,
        line: u64,
        message: String,
    },

    /// A parameter value is outside its accepted range.
    #[error("parameter {key} out of range: {message}")]
    ParameterOutOfRange { key: String, message: String },

    /// Fitting a vectorizer or classifier failed.
    #[error("fit failure: {0}")]
    Fit(String),

    /// Writing an output file failed.
    #[error("write failure at {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error (reads, directory walks, metadata).
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Pipeline graph is invalid (cycle, duplicate output, unknown stage...).
    #[error("pipeline graph error: {message}")]
    Graph { message: String },

    /// A stage command exited unsuccessfully or did not produce its outputs.
    #[error("stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    /// Experiment tracker or artifact store error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Data validation error (schema mismatch, corrupt artifact, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SpamflowError>;

impl SpamflowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a graph error from any displayable message.
    pub fn graph(msg: impl Into<String>) -> Self {
        Self::Graph {
            message: msg.into(),
        }
    }

    /// Create a parameter range error for the dotted key `key`.
    pub fn out_of_range(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ParameterOutOfRange {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a malformed-row error. `line` is 1-based and counts the header.
    pub fn malformed(path: impl Into<PathBuf>, line: u64, msg: impl Into<String>) -> Self {
        Self::MalformedRow {
            path: path.into(),
            line,
            message: msg.into(),
        }
    }

    /// Create a stage failure.
    pub fn stage_failed(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StageFailed {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    ///
    /// `NotFound` is reported as [`SpamflowError::InputMissing`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            return Self::InputMissing { path };
        }
        Self::Io { path, source }
    }

    /// Wrap a `std::io::Error` raised while producing an output.
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }
}
