//! Error types for the mailgate-smtp server.
//!
//! Typed error handling for connection transport, TLS upgrades, reverse DNS,
//! and per-session protocol failures.

use std::io;

use thiserror::Error;

/// Errors that can occur during connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// I/O error during connection operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection was closed by peer.
    #[error("Connection closed by peer")]
    Closed,

    /// Formatting error while preparing a reply.
    #[error("Reply formatting error: {0}")]
    Format(#[from] std::fmt::Error),
}

/// Errors that can occur during TLS operations.
#[derive(Debug, Error)]
pub enum TlsError {
    /// I/O error during TLS operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to load TLS certificate.
    #[error("Failed to load TLS certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to load TLS private key.
    #[error("Failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// Handshake started but the negotiated parameters could not be read.
    #[error("TLS protocol info missing: {0}")]
    ProtocolInfoMissing(String),

    /// TLS handshake or upgrade failed.
    #[error("TLS upgrade failed: {0}")]
    UpgradeFailed(String),

    /// Rustls library error.
    #[error("TLS error: {0}")]
    Rustls(String),
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

/// Errors that can occur during reverse DNS resolution.
#[derive(Debug, Error)]
pub enum DnsError {
    /// Resolver could not be constructed from system configuration.
    #[error("Failed to initialise resolver: {0}")]
    Init(String),

    /// DNS query failed due to network or resolver issues.
    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    /// DNS query timed out.
    #[error("DNS lookup timed out for {0}")]
    Timeout(String),
}

/// Errors that end a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    /// The session idled past its configured timeout.
    #[error("Session timed out")]
    Timeout,
}

/// Specialized `Result` type for connection operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Specialized `Result` type for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

/// Specialized `Result` type for session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;
