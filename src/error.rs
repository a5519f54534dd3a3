use std::fmt;
use thiserror::Error;

/// Phase of a transfer in which a transport failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// Writing the request to the server
    Request,
    /// Server writing a chunk to the client
    Send,
    /// Client reading a chunk from the server
    Receive,
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferPhase::Request => write!(f, "request"),
            TransferPhase::Send => write!(f, "send"),
            TransferPhase::Receive => write!(f, "receive"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Listen error: {0}")]
    Listen(String),

    #[error("Dial error: {0}")]
    Dial(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Stream transport error during {phase}: {message}")]
    Transport {
        phase: TransferPhase,
        message: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error: {0}")]
    Remote(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Statistics error: {0}")]
    Stats(String),

    #[error("Sample {index} failed: {source}")]
    Sample {
        index: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("Sample {index} cancelled")]
    Cancelled { index: usize },
}

impl Error {
    pub(crate) fn transport(phase: TransferPhase, err: impl fmt::Display) -> Self {
        Error::Transport {
            phase,
            message: err.to_string(),
        }
    }

    /// Attaches the 1-based sample index to a failure, leaving already
    /// indexed errors untouched.
    pub fn in_sample(self, index: usize) -> Self {
        match self {
            Error::Sample { .. } | Error::Cancelled { .. } => self,
            other => Error::Sample {
                index,
                source: Box::new(other),
            },
        }
    }

    /// Index of the sample that failed, if the error carries one.
    pub fn sample_index(&self) -> Option<usize> {
        match self {
            Error::Sample { index, .. } | Error::Cancelled { index } => Some(*index),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
