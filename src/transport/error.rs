//! Transport error types.
//!
//! Connection-level failures (`Connect`, `WriteFailure`, `FrameTooLarge`,
//! `ConnectionLost`) are what the reconnect supervisor recovers from.
//! Call-level failures (`NotConnected`, `TimedOut`, `MalformedResponse`,
//! `CallInProgress`) go straight back to the caller and are never retried.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use super::framing::FrameTooLarge;

/// Why a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Nothing is listening at the address.
    Refused,
    /// The host is known but cannot be reached.
    HostUnreachable,
    /// The host name did not resolve to any address.
    HostNotFound,
    /// No route to the network.
    NetworkUnreachable,
    /// The attempt did not complete within the connect timeout.
    TimedOut,
    /// Any other socket error.
    Other,
}

impl ConnectFailure {
    /// Classify a socket error returned by a connect attempt.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => ConnectFailure::Refused,
            io::ErrorKind::HostUnreachable => ConnectFailure::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => ConnectFailure::NetworkUnreachable,
            io::ErrorKind::TimedOut => ConnectFailure::TimedOut,
            _ => ConnectFailure::Other,
        }
    }
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectFailure::Refused => "connection refused",
            ConnectFailure::HostUnreachable => "host unreachable",
            ConnectFailure::HostNotFound => "host not found",
            ConnectFailure::NetworkUnreachable => "network unreachable",
            ConnectFailure::TimedOut => "timed out",
            ConnectFailure::Other => "socket error",
        };
        f.write_str(text)
    }
}

/// Errors surfaced by the transport.
///
/// The `Display` text is meant to be shown to an end user as-is, e.g. in a
/// status bar or a failed-operation dialog.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not establish a connection to the server.
    #[error("Connection to {endpoint} failed: {kind}")]
    Connect {
        /// Endpoint as displayed to the user (`host:port` or socket path)
        endpoint: String,
        /// Classified cause
        kind: ConnectFailure,
        /// Underlying socket error, if there was one
        #[source]
        source: Option<io::Error>,
    },

    /// The peer announced a frame above the size limit.
    #[error(transparent)]
    FrameTooLarge(#[from] FrameTooLarge),

    /// A frame could not be written completely.
    #[error("Failed to send request: {0}")]
    WriteFailure(#[source] io::Error),

    /// `call()` was issued without an established connection.
    #[error("Not connected to server")]
    NotConnected,

    /// No response arrived before the deadline.
    #[error("Request timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),

    /// A response frame was not valid JSON.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The connection dropped while a call was waiting for its response.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A second call was issued while one was still outstanding.
    #[error("Another request is already in progress")]
    CallInProgress,

    /// The request could not be serialized.
    #[error("Failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    /// The connection's event loop is no longer running.
    #[error("Transport has shut down")]
    Shutdown,
}

impl TransportError {
    /// Build a `Connect` error from a socket error, classifying its kind.
    pub fn connect(endpoint: impl fmt::Display, err: io::Error) -> Self {
        TransportError::Connect {
            endpoint: endpoint.to_string(),
            kind: ConnectFailure::from_io(&err),
            source: Some(err),
        }
    }

    /// True for failures that mean the link itself is gone.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            TransportError::Connect { .. }
                | TransportError::FrameTooLarge(_)
                | TransportError::WriteFailure(_)
                | TransportError::ConnectionLost(_)
        )
    }
}
