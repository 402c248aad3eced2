use std::time::Duration;

use thiserror::Error;

/// Failure talking to the inbound transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection reset, timeout, bad gateway and the like.
    #[error("network error: {0}")]
    Network(String),

    /// The remote side asked us to slow down.
    #[error("throttled: {message}")]
    Throttled {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Credentials or request rejected for good (e.g. revoked bot token).
    #[error("rejected by transport: {0}")]
    Rejected(String),

    /// The transport shut down underneath us (webhook server stopped).
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying with backoff can help.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Throttled { .. })
    }

    /// Delay requested by the transport itself, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Conditions the engine escalates to the process owner.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("transport unavailable after {attempts} attempt(s): {last}")]
    TransportUnavailable { attempts: u32, last: TransportError },

    /// A dispatch worker went away while the engine was still feeding it.
    #[error("dispatch worker {0} stopped unexpectedly")]
    WorkerStopped(usize),
}
