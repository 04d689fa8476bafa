//! Unified error types for the node client.
//!
//! A single `Error` enum that every subsystem can convert into, keeping the
//! state machine's and the session reader loops' error handling uniform. The
//! variants map one-to-one onto the failure classes of the protocol: what is
//! fatal to the process, what is fatal to a session, and what a session can
//! survive.

use std::fmt;
use std::io;

// ---------------------------------------------------------------------------
// Top-level client error
// ---------------------------------------------------------------------------

/// Every fallible operation in the client funnels into this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid inputs detected before any I/O (nil UUID, absent store,
    /// certificate/key mismatch). Fatal at startup.
    Config(String),
    /// OS-level failure (bind, connect, read, write, resolve); carries the
    /// errno when the OS provided one. Fatal per session.
    System { errno: i32, context: String },
    /// Cryptographic-library diagnostic. Fatal per session.
    Ssl(String),
    /// The peer closed cleanly or a half-close was detected. Normal
    /// per-session termination.
    SessionClosed,
    /// Framing, version, decode, unexpected message type, or HMAC mismatch.
    /// Fatal per session, non-fatal to the process.
    Protocol(String),
    /// Application-level failure inside a request handler. Reported to the
    /// peer; the session continues.
    Handler(String),
    /// The persistent key/value store failed.
    Store(String),
}

impl Error {
    /// Whether a session reader loop must terminate on this error.
    ///
    /// Handler errors are reported to the peer and the session continues;
    /// everything else tears the session down.
    pub fn ends_session(&self) -> bool {
        !matches!(self, Self::Handler(_))
    }

    /// Build a `System` error with an explicit errno.
    pub fn system(context: impl Into<String>, errno: i32) -> Self {
        Self::System {
            errno,
            context: context.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::System { errno, context } => {
                write!(f, "system: {context} (errno {errno})")
            }
            Self::Ssl(msg) => write!(f, "ssl: {msg}"),
            Self::SessionClosed => write!(f, "session closed by peer"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Handler(msg) => write!(f, "handler: {msg}"),
            Self::Store(msg) => write!(f, "store: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::System {
            errno: e.raw_os_error().unwrap_or(0),
            context: e.to_string(),
        }
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Self::Ssl(e.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Self::Protocol(format!("could not decode protobuf: {e}"))
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Client-wide `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;
