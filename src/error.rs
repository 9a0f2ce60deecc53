use thiserror::Error;

use crate::models::Protocol;

/// Unified error type for the validator
///
/// Most variants describe why a single candidate was dropped; the scheduler
/// recovers them locally. Only [`ScanError::NothingToDo`] and configuration
/// errors reach the process entry point.
#[derive(Error, Debug)]
pub enum ScanError {
    // Input errors
    #[error("Not a candidate: {0}")]
    NormalizationRejected(String),

    // Transport errors
    #[error("Cannot build {protocol} dialer: {reason}")]
    BuildError { protocol: Protocol, reason: String },

    #[error("Dialer already released")]
    DialerReleased,

    #[error("Tunnel error: {0}")]
    TunnelError(String),

    // Probe errors
    #[error("{protocol} probe timed out")]
    ProbeTimeout { protocol: Protocol },

    #[error("{protocol} probe refused: {reason}")]
    ProbeRefused { protocol: Protocol, reason: String },

    #[error("{protocol} probe returned a fake response: {reason}")]
    FakeResponse { protocol: Protocol, reason: String },

    #[error("No live protocol after {attempts} probes")]
    NoLiveProtocol { attempts: usize },

    // Classification errors
    #[error("Origin lookup unreachable: {0}")]
    ClassifierUnreachable(String),

    #[error("Origin lookup inconclusive: {0}")]
    ClassifierInconclusive(String),

    // Batch errors
    #[error("Nothing to do: no candidates loaded")]
    NothingToDo,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for validator operations
pub type Result<T> = std::result::Result<T, ScanError>;

/// Pipeline stage an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Normalize,
    Probe,
    Classify,
    Batch,
}

impl ScanError {
    /// Pipeline stage that produced this error
    pub fn stage(&self) -> Stage {
        match self {
            ScanError::NormalizationRejected(_) => Stage::Normalize,

            ScanError::BuildError { .. }
            | ScanError::DialerReleased
            | ScanError::TunnelError(_)
            | ScanError::ProbeTimeout { .. }
            | ScanError::ProbeRefused { .. }
            | ScanError::FakeResponse { .. }
            | ScanError::NoLiveProtocol { .. }
            | ScanError::Http(_) => Stage::Probe,

            ScanError::ClassifierUnreachable(_) | ScanError::ClassifierInconclusive(_) => {
                Stage::Classify
            }

            ScanError::NothingToDo | ScanError::InvalidConfig(_) | ScanError::Io(_) => {
                Stage::Batch
            }
        }
    }

    /// Whether this error should abort the whole batch rather than one candidate
    pub fn is_fatal(&self) -> bool {
        self.stage() == Stage::Batch
    }
}

// Convert from hyper errors
impl From<hyper::Error> for ScanError {
    fn from(err: hyper::Error) -> Self {
        ScanError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for ScanError {
    fn from(err: url::ParseError) -> Self {
        ScanError::InvalidConfig(err.to_string())
    }
}
