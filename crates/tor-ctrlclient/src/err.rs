//! Error types for the client-side facilities.

use std::sync::Arc;
use thiserror::Error;

/// An error from the configuration mirror.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConfigError {
    /// The daemon does not have a configuration key with this name.
    #[error("no configuration key named {0:?}")]
    UnknownKey(String),

    /// `config/names` used a type tag we have no parser for.
    #[error("no parser for configuration type {0:?}")]
    NoSuchParser(String),

    /// A value failed validation against its key's type.
    ///
    /// The cached configuration is unchanged when this is returned.
    #[error("invalid value for {key}: {reason}")]
    Validation {
        /// The configuration key being written.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The key exists but is not a list, and was accessed as one
    /// (or vice versa).
    #[error("configuration key {0} is not a list")]
    NotAList(String),

    /// The daemon's bootstrap responses were not in the shape we expect.
    #[error("malformed configuration bootstrap data: {0}")]
    Bootstrap(String),

    /// An error from the protocol layer.
    #[error(transparent)]
    Proto(#[from] tor_ctrlproto::Error),
}

/// An error from the info tree.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum InfoError {
    /// No info key at this path.
    #[error("no info entry at {0:?}")]
    UnknownPath(String),

    /// The path names a namespace, not a queryable leaf.
    #[error("{0:?} is a namespace, not a query")]
    NotAQuery(String),

    /// The query was called with the wrong number of arguments.
    #[error("wrong number of arguments for {path:?} (takes an argument: {takes_arg})")]
    Arity {
        /// The canonical wire path of the query.
        path: String,
        /// Whether the query wants an argument.
        takes_arg: bool,
    },

    /// The daemon's reply did not contain the requested key.
    #[error("daemon reply missing value for {0:?}")]
    MissingValue(String),

    /// An error from the protocol layer.
    #[error(transparent)]
    Proto(#[from] tor_ctrlproto::Error),
}

/// An error from the live state tracker.
///
/// Malformed events observed while running are logged and skipped, never
/// surfaced; this type covers bootstrap failures only.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum StateError {
    /// The priming queries returned data we could not parse.
    #[error("malformed state bootstrap data: {0}")]
    Bootstrap(String),

    /// An error from the protocol layer.
    #[error(transparent)]
    Proto(#[from] tor_ctrlproto::Error),
}

/// An error from launching a Tor subprocess.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LaunchError {
    /// An io error while preparing or spawning the subprocess.
    #[error("io error while launching tor: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// The subprocess wrote to stderr, which we treat as fatal.
    #[error("tor subprocess wrote to stderr: {0}")]
    SubprocessStderr(String),

    /// The subprocess exited before bootstrap completed.
    #[error("tor subprocess exited with code {code:?}")]
    SubprocessExit {
        /// The exit code, if there was one.
        code: Option<i32>,
        /// Everything the subprocess wrote to stdout, for diagnosis.
        stdout: Vec<String>,
    },

    /// An error from the control connection to the new daemon.
    #[error(transparent)]
    Proto(#[from] tor_ctrlproto::Error),

    /// The seed configuration could not be prepared.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<std::io::Error> for LaunchError {
    fn from(e: std::io::Error) -> Self {
        LaunchError::Io(Arc::new(e))
    }
}

/// An error from bootstrapping the full client layer.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BootstrapError {
    /// The configuration mirror failed to load.
    #[error("configuration mirror failed: {0}")]
    Config(#[from] ConfigError),
    /// The state tracker failed to start.
    #[error("state tracker failed: {0}")]
    State(#[from] StateError),
    /// The info tree failed to load.
    #[error("info tree failed: {0}")]
    Info(#[from] InfoError),
}
