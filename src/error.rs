// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

/// Boxed error type used at task join boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid glob pattern: {0}")]
    InvalidGlob(String),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("unknown encoding('{0}')")]
    UnknownEncoding(String),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Can only start an input when all related states are finished: {0}")]
    ConflictingState(String),

    #[error("channel send error")]
    ChannelSend,
}

impl Error {
    /// True for errors that should abort startup with a non-zero exit code
    /// instead of being retried at runtime.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::InvalidGlob(_)
                | Error::Pattern(_)
                | Error::UnknownEncoding(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
