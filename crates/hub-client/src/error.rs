use std::time::Duration;
use thiserror::Error;

/// Failures of the physical hub connection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Failed to open the hub socket: {0}")]
    Connect(String),

    #[error("The hub rejected the handshake: {0}")]
    HandshakeRejected(String),

    #[error("The hub did not complete the handshake within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Malformed hub message: {0}")]
    Protocol(String),

    #[error("The hub connection was lost: {0}")]
    ConnectionLost(String),

    #[error("The hub closed the connection: {0}")]
    ServerClosed(String),

    #[error("No message from the hub within {0:?}")]
    ServerTimeout(Duration),

    #[error("Hub method '{method}' failed: {message}")]
    Invocation { method: String, message: String },

    #[error("No live hub connection")]
    NotConnected,
}

/// Failures visible to callers of `TransportSession::connect`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("No bearer token is available for the hub")]
    MissingCredential,

    #[error("Hub transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Gave up connecting after {attempts} attempts: {last}")]
    MaxAttemptsExceeded {
        attempts: u32,
        last: Box<SessionError>,
    },

    #[error("The session was stopped")]
    Stopped,

    #[error("Invalid hub endpoint: {0}")]
    InvalidEndpoint(String),
}
