use thiserror::Error;

/// Errors produced by the gatemesh protocol and runtime layers.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Connection-fatal protocol violation (bad handshake, unknown message).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A wire payload that could not be decoded. Connection-fatal.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Attempted to send on a connection that is not authenticated.
    #[error("not connected")]
    NotConnected,

    /// No response arrived within the request deadline. Request-local.
    #[error("timeout")]
    Timeout,

    /// The far side returned an explicit failure.
    #[error("remote error: {0}")]
    Remote(String),

    /// A pre-side-effect check failed (permission, funds, gate state).
    #[error("{0}")]
    Validation(String),

    /// A refund or state-reversal step itself failed. Logged, never rethrown
    /// over the failure it was cleaning up after.
    #[error("rollback failed: {0}")]
    Rollback(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ciborium::de::Error<std::io::Error>> for MeshError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        MeshError::Malformed(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for MeshError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        MeshError::Malformed(e.to_string())
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
