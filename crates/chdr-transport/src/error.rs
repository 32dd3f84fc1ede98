use std::net::SocketAddr;

/// Errors that can occur in link and buffer-pool operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind a local socket.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to connect to the remote endpoint.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// An I/O error occurred on the underlying link.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Every frame of the pool is currently held by a caller.
    #[error("frame pool exhausted ({capacity} frames in flight)")]
    PoolExhausted { capacity: usize },

    /// Link parameters failed validation.
    #[error("invalid link parameters: {0}")]
    InvalidParams(String),

    /// The link has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;
