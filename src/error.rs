//! Error types for PeerGate.
//!
//! Only configuration, directory-connect, and listener errors can terminate
//! the process; everything that happens on behalf of a single request is
//! contained in the request pipeline and surfaces as an HTTP status instead.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::directory::DirectoryError;

/// Fatal gateway errors.
///
/// Every variant here either prevents startup or fails the overall run during
/// shutdown. Per-request outcomes (denials, upstream failures) are never
/// represented as a `GateError`.
#[derive(Debug, Error)]
pub enum GateError {
    /// State directory could not be created.
    #[error("failed to create state directory {path:?}: {source}")]
    StateDir {
        /// Configured state directory path
        path: PathBuf,
        /// Underlying filesystem error
        source: std::io::Error,
    },

    /// State directory exists but is not writable.
    #[error("state directory {path:?} is not writable")]
    StateDirNotWritable {
        /// Configured state directory path
        path: PathBuf,
    },

    /// A trusted range entry did not parse as a CIDR prefix.
    #[error("invalid trusted range {range:?}: {source}")]
    InvalidTrustedRange {
        /// The offending list entry, verbatim
        range: String,
        /// Parse error from `ipnet`
        source: ipnet::AddrParseError,
    },

    /// The upstream origin URL is missing or unusable.
    #[error("invalid upstream URL {url:?}: {reason}")]
    InvalidUpstream {
        /// The URL as given on the command line
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// TLS certificate or key file could not be read.
    #[error("failed to read TLS material {path:?}: {source}")]
    TlsRead {
        /// Path of the certificate or key file
        path: PathBuf,
        /// Underlying filesystem error
        source: std::io::Error,
    },

    /// TLS certificate/key pair was rejected by rustls.
    #[error("invalid TLS certificate/key pair: {0}")]
    TlsConfig(#[from] rustls::Error),

    /// The network-identity directory could not be reached at startup.
    #[error("failed to connect to identity directory: {0}")]
    DirectoryConnect(#[from] DirectoryError),

    /// The upstream HTTP client could not be initialized.
    #[error("failed to initialize upstream HTTP client: {0}")]
    HttpClient(#[source] std::io::Error),

    /// A listener socket could not be bound.
    #[error("failed to bind {listener} listener on {addr}: {source}")]
    Bind {
        /// Listener name (`"http"` or `"https"`)
        listener: &'static str,
        /// Address that was requested
        addr: SocketAddr,
        /// Underlying socket error
        source: std::io::Error,
    },

    /// In-flight connections did not finish within the drain grace period.
    #[error("{listener} listener did not drain within the grace period")]
    DrainTimeout {
        /// Listener name (`"http"` or `"https"`)
        listener: &'static str,
    },

    /// A listener task aborted or panicked.
    #[error("{listener} listener task failed: {reason}")]
    ListenerTask {
        /// Listener name
        listener: &'static str,
        /// Join error description
        reason: String,
    },
}
