//! Define an error type for the tor-ctrlproto crate.

use std::sync::Arc;
use thiserror::Error;

/// An error originating from the control-port protocol layer.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The daemon sent bytes that do not parse as a control-protocol line.
    ///
    /// This is fatal to the connection: once framing is lost there is no
    /// way to resynchronize, so every pending command fails with a clone
    /// of this error.
    #[error("malformed control line: {0}")]
    MalformedFrame(String),

    /// An error from the io system when using the transport.
    ///
    /// (Wrapped in an Arc so that this error type can be Clone; the same
    /// failure is delivered to every pending command.)
    #[error("io error on control connection: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// The transport was closed before we were done with it.
    #[error("control connection closed")]
    ConnectionClosed,

    /// The authentication handshake failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The daemon rejected a command with a non-2xx status.
    ///
    /// This surfaces only to the caller that queued the command; other
    /// commands on the same connection are unaffected.
    #[error("command failed with status {code}: {text}")]
    Command {
        /// The 3-digit status code from the reply.
        code: u16,
        /// The reply payload, joined with newlines if it spanned lines.
        text: String,
    },

    /// The daemon violated the control protocol in a way we can't recover
    /// from at the command level.
    #[error("control protocol violation: {0}")]
    Proto(String),

    /// There was a programming error somewhere in our code.
    #[error("internal programming error: {0}")]
    Internal(&'static str),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    /// Return true if this error indicates the whole connection is dead,
    /// as opposed to a single command or handshake having failed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MalformedFrame(_) | Error::Io(_) | Error::ConnectionClosed
        )
    }
}

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
