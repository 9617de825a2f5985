//! Custom error types for promptpool.
//!
//! This module defines all error types used throughout the crate,
//! following Rust best practices with `thiserror` for library errors.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while configuring or running a batch.
#[derive(Error, Debug)]
pub enum PoolError {
    /// `run` was called before a model was selected.
    #[error("no model selected - call set_model before run")]
    NoModelSelected,

    /// The requested model is not in the cached catalog.
    #[error("unknown model '{0}' - not in the catalog returned by the API")]
    UnknownModel(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The model catalog could not be fetched or parsed.
    #[error("could not fetch model catalog: {message}")]
    Catalog {
        /// Description of what went wrong.
        message: String,
    },

    /// HTTP request failed at the transport level.
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// The API returned an error or an unreadable response.
    #[error("API error: {message}")]
    Api {
        /// The classified error message, `[<type>] <message>` when the
        /// server provided both.
        message: String,
    },

    /// Failed to read the configuration file.
    #[error("failed to read config file '{path}': {source}")]
    ConfigFileRead {
        /// Path to the file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to read an input file.
    #[error("failed to read input file '{path}': {source}")]
    InputFileRead {
        /// Path to the file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for promptpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
