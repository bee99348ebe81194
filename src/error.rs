use std::borrow::Cow;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used by the fallible edges of the service (store, config, server).
pub(crate) type Result<T> = std::result::Result<T, SlotwatchError>;

/// Error surface for everything outside the in-memory registry.
///
/// The registry itself never fails; errors only come from persistence,
/// configuration, and the HTTP listener.
#[derive(Debug, Error)]
pub(crate) enum SlotwatchError {
    #[error("I/O error: {source}")]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: Cow<'static, str> },

    #[error("HTTP server error: {0}")]
    Server(String),
}

impl From<std::io::Error> for SlotwatchError {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }
}

impl SlotwatchError {
    pub(crate) fn io_at(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    pub(crate) fn invalid_config(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}
