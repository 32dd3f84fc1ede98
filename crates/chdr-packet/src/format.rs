use bytes::{Buf, BufMut};

use crate::error::{PacketError, Result};
use crate::header::{ChdrHeader, PacketType};

/// Native word width of a CHDR link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChdrWidth {
    #[default]
    W64,
    W128,
    W256,
    W512,
}

impl ChdrWidth {
    /// Width in bits.
    pub fn bits(self) -> usize {
        match self {
            ChdrWidth::W64 => 64,
            ChdrWidth::W128 => 128,
            ChdrWidth::W256 => 256,
            ChdrWidth::W512 => 512,
        }
    }

    /// Width in bytes.
    pub fn bytes(self) -> usize {
        self.bits() / 8
    }

    /// Parse a width given in bits.
    pub fn from_bits(bits: usize) -> Result<Self> {
        match bits {
            64 => Ok(ChdrWidth::W64),
            128 => Ok(ChdrWidth::W128),
            256 => Ok(ChdrWidth::W256),
            512 => Ok(ChdrWidth::W512),
            other => Err(PacketError::UnsupportedWidth(other)),
        }
    }

    /// 3-bit code carried in management packets.
    pub fn code(self) -> u8 {
        match self {
            ChdrWidth::W64 => 0,
            ChdrWidth::W128 => 1,
            ChdrWidth::W256 => 2,
            ChdrWidth::W512 => 3,
        }
    }

    /// Inverse of [`ChdrWidth::code`].
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(ChdrWidth::W64),
            1 => Ok(ChdrWidth::W128),
            2 => Ok(ChdrWidth::W256),
            3 => Ok(ChdrWidth::W512),
            other => Err(PacketError::InvalidPayload(format!("invalid CHDR width code {other}"))),
        }
    }
}

/// Byte order of 64-bit words on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl Endianness {
    /// Read one 64-bit word from the first 8 bytes of `src`.
    ///
    /// # Panics
    ///
    /// Panics if `src` is shorter than 8 bytes.
    pub fn read_u64(self, mut src: &[u8]) -> u64 {
        match self {
            Endianness::Little => src.get_u64_le(),
            Endianness::Big => src.get_u64(),
        }
    }

    /// Write one 64-bit word into the first 8 bytes of `dst`.
    ///
    /// # Panics
    ///
    /// Panics if `dst` is shorter than 8 bytes.
    pub fn write_u64(self, mut dst: &mut [u8], value: u64) {
        match self {
            Endianness::Little => dst.put_u64_le(value),
            Endianness::Big => dst.put_u64(value),
        }
    }
}

/// Word width and byte order of a CHDR link.
///
/// All layout arithmetic that depends on the link lives here so that the
/// header itself stays a plain host-native value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChdrFormat {
    pub width: ChdrWidth,
    pub endianness: Endianness,
}

impl ChdrFormat {
    /// Create a format.
    pub fn new(width: ChdrWidth, endianness: Endianness) -> Self {
        Self { width, endianness }
    }

    /// Bytes per CHDR word.
    pub fn word_bytes(&self) -> usize {
        self.width.bytes()
    }

    /// Whether the timestamp occupies a word of its own.
    ///
    /// Only true on 64-bit links; wider links carry the timestamp inside
    /// the header word.
    pub fn has_timestamp(&self, header: &ChdrHeader) -> bool {
        header.pkt_type == PacketType::DataWithTs && self.width == ChdrWidth::W64
    }

    /// Byte offset of the first metadata word.
    pub fn metadata_byte_offset(&self, header: &ChdrHeader) -> usize {
        self.word_bytes() * (1 + usize::from(self.has_timestamp(header)))
    }

    /// Byte offset of the payload.
    pub fn payload_byte_offset(&self, header: &ChdrHeader) -> usize {
        self.metadata_byte_offset(header) + usize::from(header.num_mdata) * self.word_bytes()
    }

    /// Payload length in bytes implied by the `length` field.
    ///
    /// Zero when `length` is smaller than the payload offset.
    pub fn payload_byte_length(&self, header: &ChdrHeader) -> usize {
        usize::from(header.length).saturating_sub(self.payload_byte_offset(header))
    }

    /// Set `num_mdata` and recompute `length` from word counts.
    pub fn set_packet_size(
        &self,
        header: &mut ChdrHeader,
        num_payload_words: usize,
        num_mdata_words: usize,
    ) -> Result<()> {
        let num_mdata = u8::try_from(num_mdata_words)
            .ok()
            .filter(|n| *n <= crate::header::MAX_NUM_MDATA)
            .ok_or_else(|| {
                PacketError::InvalidPayload(format!(
                    "{num_mdata_words} metadata words exceed the 7-bit field"
                ))
            })?;
        header.num_mdata = num_mdata;
        let payload_bytes = num_payload_words * self.word_bytes();
        self.set_length(header, payload_bytes)
    }

    /// Recompute `length` for `payload_bytes`, keeping `num_mdata`.
    pub(crate) fn set_length(&self, header: &mut ChdrHeader, payload_bytes: usize) -> Result<()> {
        let total = self.payload_byte_offset(header) + payload_bytes;
        header.length = u16::try_from(total).map_err(|_| PacketError::PayloadTooLarge {
            size: total,
            max: usize::from(u16::MAX),
        })?;
        Ok(())
    }

    /// Write the header word at the start of `dst`.
    pub fn write_header(&self, dst: &mut [u8], header: &ChdrHeader) -> Result<()> {
        check_len(dst.len(), 8)?;
        self.endianness.write_u64(dst, header.pack());
        Ok(())
    }

    /// Read the header word at the start of `src`.
    pub fn read_header(&self, src: &[u8]) -> Result<ChdrHeader> {
        check_len(src.len(), 8)?;
        ChdrHeader::unpack(self.endianness.read_u64(src))
    }
}

pub(crate) fn check_len(len: usize, needed: usize) -> Result<()> {
    if len < needed {
        return Err(PacketError::Truncated { len, needed });
    }
    Ok(())
}
