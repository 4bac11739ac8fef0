use crate::transport::{RouterError, TransportError};
use thiserror::Error;

/// Failure modes of the control core. Startup variants are fatal; everything
/// a peer can provoke is a per-call error the caller may retry.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("identity error: {0}")]
    Identity(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error("invalid destination hash: {0}")]
    InvalidDestination(String),
    #[error("invalid content hash: {0}")]
    InvalidContentHash(String),
    #[error("unknown destination identity")]
    UnknownIdentity,
    #[error("no path to destination")]
    NoPath,
    #[error("link not found")]
    LinkNotFound,
    #[error("link closed")]
    LinkClosed,
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("resource transfer failed: {0}")]
    ResourceFailed(String),
    #[error("timed out")]
    Timeout,
    #[error("protocol mismatch: {0}")]
    Protocol(String),
    #[error("local loopback delivery failed")]
    LoopbackDelivery,
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NodeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// True for conditions the caller can reasonably retry once transport
    /// state changes (a path appears, an interface comes back online).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoPath
                | Self::LinkClosed
                | Self::LinkNotFound
                | Self::RequestFailed(_)
                | Self::ResourceFailed(_)
                | Self::Timeout
        )
    }
}
