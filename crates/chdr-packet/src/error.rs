use crate::header::PacketType;

/// Errors that can occur while parsing or building CHDR packets.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// The buffer is too short for the structure being read.
    #[error("truncated packet ({len} bytes, need {needed})")]
    Truncated { len: usize, needed: usize },

    /// The header carries a reserved packet type code.
    #[error("invalid packet type code {0}")]
    InvalidPacketType(u8),

    /// The header length field disagrees with the buffer or the header layout.
    #[error("length field {length} inconsistent with packet layout ({reason})")]
    LengthMismatch { length: usize, reason: &'static str },

    /// The content does not fit the destination buffer or field.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A payload field holds a value outside its domain.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A typed payload was requested from a packet of another type.
    #[error("expected {expected:?} packet, found {found:?}")]
    WrongPacketType {
        expected: PacketType,
        found: PacketType,
    },

    /// The word width is not one of 64, 128, 256 or 512 bits.
    #[error("unsupported CHDR width {0} bits")]
    UnsupportedWidth(usize),
}

pub type Result<T> = std::result::Result<T, PacketError>;
