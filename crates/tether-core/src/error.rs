//! Error types for tether-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::ipc::CodecError;

/// Result type for tether-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tether-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to spawn the subprocess.
    #[error("failed to spawn subprocess '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The subprocess is not available (exited, restarting or shut down).
    #[error("subprocess is closed")]
    Closed,

    /// IO error while talking to the subprocess.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame on the subprocess output stream.
    #[error("frame error: {0}")]
    Codec(#[from] CodecError),

    /// The subprocess answered on stderr.
    #[error("{0}")]
    Subprocess(String),

    /// An operation did not complete in the allotted time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Failed to read a configuration file.
    #[error("failed to load config {path}: {message}")]
    ConfigFile { path: PathBuf, message: String },

    /// A lock was poisoned by a panicking thread.
    #[error("lock poisoned: {0}")]
    Lock(String),
}

impl Error {
    /// Whether this error means the subprocess was unavailable for the call.
    ///
    /// Calls failing this way are expected to succeed once the supervisor
    /// has restarted the process.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    /// Format the error with a recovery hint where one is known.
    pub fn with_hint(&self) -> String {
        match self {
            Error::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                format!("{self}\n  hint: check that the command exists and is on PATH")
            }
            Error::Spawn { source, .. }
                if source.kind() == std::io::ErrorKind::PermissionDenied =>
            {
                format!("{self}\n  hint: the command is not executable")
            }
            Error::Codec(CodecError::TokenTooLong { .. }) => {
                format!("{self}\n  hint: raise max_buffer above the largest expected response")
            }
            Error::Timeout(_) => {
                format!("{self}\n  hint: the subprocess keeps shutting down in the background")
            }
            _ => self.to_string(),
        }
    }
}
