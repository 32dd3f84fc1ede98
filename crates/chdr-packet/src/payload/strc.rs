use super::{field, place, ChdrPayload, WordReader, WordWriter};
use crate::error::{PacketError, Result};
use crate::format::ChdrFormat;
use crate::header::PacketType;

const STRC_WORDS: usize = 2;

/// Stream command opcode.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StrcOpCode {
    /// Initialize flow control.
    #[default]
    Init = 0,
    /// Request a stream status.
    Ping = 1,
    /// Resynchronize transfer counters.
    Resync = 2,
}

impl TryFrom<u8> for StrcOpCode {
    type Error = PacketError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(StrcOpCode::Init),
            1 => Ok(StrcOpCode::Ping),
            2 => Ok(StrcOpCode::Resync),
            other => Err(PacketError::InvalidPayload(format!(
                "invalid stream command opcode {other}"
            ))),
        }
    }
}

/// Stream command sent to a stream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StrcPayload {
    pub src_epid: u16,
    pub op_code: StrcOpCode,
    /// Opcode-specific 4-bit argument.
    pub op_data: u8,
    /// Packet count (40 bits).
    pub num_pkts: u64,
    pub num_bytes: u64,
}

impl ChdrPayload for StrcPayload {
    const PACKET_TYPE: PacketType = PacketType::StreamCommand;

    fn serialize(&self, dst: &mut [u8], format: &ChdrFormat) -> Result<usize> {
        let mut writer = WordWriter::new(dst, format.endianness);
        writer.put_word(
            place(u64::from(self.src_epid), 0, 16)
                | place(self.op_code as u64, 16, 4)
                | place(u64::from(self.op_data), 20, 4)
                | place(self.num_pkts, 24, 40),
        )?;
        writer.put_word(self.num_bytes)?;
        Ok(writer.written())
    }

    fn deserialize(src: &[u8], format: &ChdrFormat) -> Result<Self> {
        let mut reader = WordReader::new(src, format.endianness);
        let w0 = reader.next_word()?;
        let w1 = reader.next_word()?;
        Ok(Self {
            src_epid: field(w0, 0, 16) as u16,
            op_code: StrcOpCode::try_from(field(w0, 16, 4) as u8)?,
            op_data: field(w0, 20, 4) as u8,
            num_pkts: field(w0, 24, 40),
            num_bytes: w1,
        })
    }

    fn length_words(&self, _format: &ChdrFormat) -> usize {
        STRC_WORDS
    }
}
