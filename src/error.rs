//! Error Types
//!
//! Load-time failures surface as values; kernel shape mismatches are
//! programmer errors and assert instead.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed model container: {0}")]
    MalformedModel(String),

    #[error("malformed shortlist: {0}")]
    MalformedShortlist(String),

    #[error("model is missing parameter {0}")]
    MissingParameter(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("tokenizer: {0}")]
    Tokenizer(String),

    #[error("translation was abandoned before completion")]
    Abandoned,
}
