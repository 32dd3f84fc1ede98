use std::time::Duration;

use chdr_packet::PacketError;
use chdr_transport::TransportError;

/// Errors that can occur in control-plane operations.
#[derive(Debug, thiserror::Error)]
pub enum CtrlError {
    /// The underlying link failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A control packet could not be built or parsed.
    #[error(transparent)]
    Packet(#[from] PacketError),

    /// No acknowledgment or buffer space within the deadline.
    #[error("control operation timed out after {0:?} ({1})")]
    Timeout(Duration, &'static str),

    /// The send link had no free frame within the deadline.
    #[error("no send frame available within {0:?}")]
    SendBuffUnavailable(Duration),

    /// The device reported a failing status.
    #[error("control operation returned a failing status")]
    CommandError,

    /// The device reported a late timed command.
    #[error("control operation returned a timestamp error")]
    TimestampError,

    /// The response to a request was lost.
    #[error("response for a control transaction was dropped")]
    SequenceError,

    /// The response carried no data.
    #[error("control operation returned a malformed response")]
    MalformedResponse,

    /// A control packet arrived for a port with no endpoint.
    #[error("no ctrlport endpoint on port {0}")]
    UnknownPort(u16),

    /// The caller passed an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The control endpoint has been shut down.
    #[error("control endpoint shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, CtrlError>;
