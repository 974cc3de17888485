use std::{io, path::PathBuf};

use thiserror::Error;

/// Failures of explicit cache maintenance and store operations.
///
/// Lookups never surface these; a failed lookup is a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid cache path `{0}`")]
    InvalidPath(String),
    #[error("cache task aborted: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
