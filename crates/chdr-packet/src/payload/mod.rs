//! Typed CHDR payloads.
//!
//! Every payload is a sequence of 64-bit words in the link's byte order.
//! Payloads know nothing about offsets inside a packet; they are handed
//! the payload region by [`ChdrPacket`](crate::ChdrPacket).

mod ctrl;
mod mgmt;
mod strc;
mod strs;

use bytes::{Buf, BufMut};

pub use ctrl::{CtrlOpCode, CtrlPayload, CtrlStatus, MAX_CTRL_DATA};
pub use mgmt::{CfgPayload, MgmtHop, MgmtOp, MgmtOpCode, MgmtPayload, NodeInfoPayload};
pub use strc::{StrcOpCode, StrcPayload};
pub use strs::{StrsPayload, StrsStatus};

use crate::error::{PacketError, Result};
use crate::format::{ChdrFormat, Endianness};
use crate::header::{ChdrHeader, PacketType};

/// A payload that can be carried by a CHDR packet.
pub trait ChdrPayload: Sized {
    /// Packet type that carries this payload.
    const PACKET_TYPE: PacketType;

    /// Serialize into `dst`, returning the number of bytes written.
    fn serialize(&self, dst: &mut [u8], format: &ChdrFormat) -> Result<usize>;

    /// Deserialize from a payload region.
    fn deserialize(src: &[u8], format: &ChdrFormat) -> Result<Self>;

    /// Serialized length in 64-bit words.
    fn length_words(&self, format: &ChdrFormat) -> usize;

    /// Fill the header fields implied by this payload.
    fn populate_header(&self, header: &mut ChdrHeader) {
        header.pkt_type = Self::PACKET_TYPE;
        header.flags = 0;
        header.num_mdata = 0;
    }
}

/// Sequential 64-bit word reader.
pub(crate) struct WordReader<'a> {
    src: &'a [u8],
    endianness: Endianness,
}

impl<'a> WordReader<'a> {
    pub(crate) fn new(src: &'a [u8], endianness: Endianness) -> Self {
        Self { src, endianness }
    }

    pub(crate) fn next_word(&mut self) -> Result<u64> {
        if self.src.remaining() < 8 {
            return Err(PacketError::Truncated {
                len: self.src.remaining(),
                needed: 8,
            });
        }
        Ok(match self.endianness {
            Endianness::Little => self.src.get_u64_le(),
            Endianness::Big => self.src.get_u64(),
        })
    }

    pub(crate) fn skip_words(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.next_word()?;
        }
        Ok(())
    }
}

/// Sequential 64-bit word writer.
pub(crate) struct WordWriter<'a> {
    dst: &'a mut [u8],
    endianness: Endianness,
    capacity: usize,
}

impl<'a> WordWriter<'a> {
    pub(crate) fn new(dst: &'a mut [u8], endianness: Endianness) -> Self {
        let capacity = dst.len();
        Self {
            dst,
            endianness,
            capacity,
        }
    }

    pub(crate) fn put_word(&mut self, word: u64) -> Result<()> {
        if self.dst.remaining_mut() < 8 {
            return Err(PacketError::PayloadTooLarge {
                size: self.written() + 8,
                max: self.capacity,
            });
        }
        match self.endianness {
            Endianness::Little => self.dst.put_u64_le(word),
            Endianness::Big => self.dst.put_u64(word),
        }
        Ok(())
    }

    pub(crate) fn put_zeros(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.put_word(0)?;
        }
        Ok(())
    }

    pub(crate) fn written(&self) -> usize {
        self.capacity - self.dst.len()
    }
}

/// Extract `width` bits starting at `offset`.
pub(crate) fn field(word: u64, offset: u32, width: u32) -> u64 {
    (word >> offset) & mask(width)
}

/// Place the low `width` bits of `value` at `offset`.
pub(crate) fn place(value: u64, offset: u32, width: u32) -> u64 {
    (value & mask(width)) << offset
}

fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}
