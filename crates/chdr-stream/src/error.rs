use chdr_packet::PacketError;
use chdr_transport::TransportError;

/// Errors surfaced by receive transports and the alignment engine.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// A packet was lost on one channel.
    #[error("sequence error on channel {channel} (expected {expected}, received {received})")]
    SequenceError {
        channel: usize,
        expected: u16,
        received: u16,
    },

    /// Channel timestamps did not converge.
    #[error("alignment failed after {iterations} reference re-elections")]
    AlignmentFailure { iterations: usize },

    /// A frame on one channel could not be parsed and was discarded.
    #[error("bad packet on channel {channel}: {source}")]
    BadPacket {
        channel: usize,
        source: PacketError,
    },

    /// A frame could not be parsed and was discarded.
    #[error("malformed packet: {0}")]
    Packet(#[from] PacketError),

    /// No send frame was free for a stream status packet.
    #[error("no send frame available for a flow control response")]
    FlowCtrlBuffUnavailable,

    /// The underlying link failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, StreamError>;
