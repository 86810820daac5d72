//! Error types for registry operations.

use crate::models::RegistryVersion;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by the registry storage layer.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The stored index was written by an incompatible major version.
    #[error(
        "Incompatible registry version {found}; this build supports version {expected}. \
         Migrate the registry with the migration tool before continuing"
    )]
    IncompatibleVersion {
        found: RegistryVersion,
        expected: RegistryVersion,
    },

    /// A version string could not be parsed.
    #[error("Invalid registry version string: {0:?}")]
    InvalidVersion(String),

    /// The registry lock could not be acquired in time.
    #[error("Timed out after {waited_secs}s waiting for registry lock {}", path.display())]
    LockTimeout { path: PathBuf, waited_secs: u64 },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl RegistryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }

    /// Whether this error must stop the host application.
    ///
    /// Only a schema version mismatch is fatal; everything else is scoped to
    /// the operation that hit it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::IncompatibleVersion { .. })
    }
}

/// Result alias for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
