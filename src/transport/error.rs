use std::io;

use crate::pool::PoolError;

/// Error returned by a unit of work run against a connection
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    /// Explicit "this endpoint is gone" signal raised by a capability
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The backend answered, but not with what was expected
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkError {
    /// Whether this failure is a network-layer fault
    ///
    /// Network faults mark the connection dead. Everything else is treated as
    /// transient and retried on the same connection.
    pub fn is_network(&self) -> bool {
        match self {
            WorkError::ConnectionRefused(_) => true,
            WorkError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::AddrNotAvailable
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::UnexpectedEof
            ),
            WorkError::Protocol(_) | WorkError::Other(_) => false,
        }
    }
}

/// Error returned to transport callers
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No connection available")]
    NoConnectionAvailable,

    /// Terminal failure after the retry policy gave up
    #[error("Request failed after {attempts} attempt(s): {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: WorkError,
    },

    #[error("Transport is shut down")]
    Closed,

    #[error("Request outcome was not delivered")]
    Undelivered,
}

impl TransportError {
    /// The work error behind a terminal failure, if any
    pub fn work_error(&self) -> Option<&WorkError> {
        match self {
            TransportError::Failed { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Number of attempts made before failing (0 when nothing was attempted)
    pub fn attempts(&self) -> u32 {
        match self {
            TransportError::Failed { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}

impl From<PoolError> for TransportError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NoConnectionAvailable => TransportError::NoConnectionAvailable,
        }
    }
}
