//! Configuration for the subprocess step.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ipc::{Codec, DEFAULT_MAX_BUFFER};

/// Default time spent collecting follow-up stderr lines after the first one.
pub const DEFAULT_STDERR_WINDOW_MS: u64 = 1000;

/// Default time a closing subprocess gets to exit on its own before it is killed.
pub const DEFAULT_CLOSE_GRACE_MS: u64 = 1000;

/// Upper bound for the stderr window and the close grace period (one hour).
const MAX_WINDOW_MS: u64 = 60 * 60 * 1000;

/// Configuration for a supervised subprocess and the step driving it.
///
/// Every field has a default, so config files only need to name what they
/// change:
///
/// ```
/// use tether_core::{Codec, SubprocessConfig};
///
/// let config = SubprocessConfig::from_toml_str(r#"
///     name = "tr"
///     args = ["a-z", "A-Z"]
///     codec_send = "netstring"
/// "#).unwrap();
///
/// assert_eq!(config.codec_send, Codec::Netstring);
/// assert_eq!(config.codec_recv, Codec::Lines);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SubprocessConfig {
    /// The command to execute.
    pub name: String,

    /// Arguments passed to the command.
    pub args: Vec<String>,

    /// Indices of the batch parts to process. Empty means all parts;
    /// negative indices count from the end of the batch.
    pub parts: Vec<isize>,

    /// Maximum size of a single response frame, in bytes.
    pub max_buffer: usize,

    /// Framing of requests written to the subprocess stdin.
    pub codec_send: Codec,

    /// Framing of responses read from the subprocess stdout.
    pub codec_recv: Codec,

    /// How long to keep collecting stderr lines once an error line arrived.
    pub stderr_window_ms: u64,

    /// How long a closing subprocess may take to exit before it is killed.
    pub close_grace_ms: u64,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            name: "cat".to_string(),
            args: Vec::new(),
            parts: Vec::new(),
            max_buffer: DEFAULT_MAX_BUFFER,
            codec_send: Codec::Lines,
            codec_recv: Codec::Lines,
            stderr_window_ms: DEFAULT_STDERR_WINDOW_MS,
            close_grace_ms: DEFAULT_CLOSE_GRACE_MS,
        }
    }
}

impl SubprocessConfig {
    /// Create a config running `name` with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the command arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the send and receive codecs.
    pub fn with_codecs(mut self, send: Codec, recv: Codec) -> Self {
        self.codec_send = send;
        self.codec_recv = recv;
        self
    }

    /// Restrict processing to the given part indices.
    pub fn with_parts(mut self, parts: impl Into<Vec<isize>>) -> Self {
        self.parts = parts.into();
        self
    }

    /// Set the maximum response frame size.
    pub fn with_max_buffer(mut self, max_buffer: usize) -> Self {
        self.max_buffer = max_buffer;
        self
    }

    /// Set the stderr aggregation window.
    pub fn with_stderr_window(mut self, window: Duration) -> Self {
        self.stderr_window_ms = window.as_millis() as u64;
        self
    }

    /// Set the grace period given to the subprocess on close.
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace_ms = grace.as_millis() as u64;
        self
    }

    /// The stderr aggregation window as a duration.
    pub fn stderr_window(&self) -> Duration {
        Duration::from_millis(self.stderr_window_ms)
    }

    /// The close grace period as a duration.
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// The command line, for logging.
    pub fn command_line(&self) -> String {
        std::iter::once(self.name.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Locate the command on `PATH`.
    ///
    /// A command that exists but is not executable fails with
    /// `PermissionDenied` rather than `NotFound`.
    pub fn resolve_program(&self) -> Result<PathBuf> {
        which::which(&self.name).map_err(|e| {
            let kind = if find_file(&self.name).is_some() {
                std::io::ErrorKind::PermissionDenied
            } else {
                std::io::ErrorKind::NotFound
            };
            Error::Spawn {
                command: self.command_line(),
                source: std::io::Error::new(kind, e.to_string()),
            }
        })
    }

    /// Check the configuration for values that can never work.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("name must not be empty".to_string()));
        }
        if self.max_buffer == 0 {
            return Err(Error::Config("max_buffer must be positive".to_string()));
        }
        if self.stderr_window_ms > MAX_WINDOW_MS {
            return Err(Error::Config(format!(
                "stderr_window_ms must be at most {}",
                MAX_WINDOW_MS
            )));
        }
        if self.close_grace_ms > MAX_WINDOW_MS {
            return Err(Error::Config(format!(
                "close_grace_ms must be at most {}",
                MAX_WINDOW_MS
            )));
        }
        Ok(())
    }

    /// Parse a TOML config.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config.
    pub fn from_json_str(source: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(source).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, choosing the format from its extension.
    ///
    /// `.toml` and `.json` files are supported.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file_error = |message: String| Error::ConfigFile {
            path: path.to_path_buf(),
            message,
        };

        let source = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
        let parsed = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&source),
            Some("json") => Self::from_json_str(&source),
            _ => {
                return Err(file_error(
                    "unsupported config format (expected .toml or .json)".to_string(),
                ));
            }
        };
        parsed.map_err(|e| match e {
            Error::Config(message) => file_error(message),
            other => other,
        })
    }
}

/// Find a regular file named `name`, ignoring whether it is executable.
///
/// Names with a path separator are taken as paths, anything else is looked up
/// in each `PATH` directory.
fn find_file(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    let dirs = std::env::var_os("PATH")?;
    std::env::split_paths(&dirs)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
