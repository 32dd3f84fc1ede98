use super::{field, place, ChdrPayload, WordReader, WordWriter};
use crate::error::{PacketError, Result};
use crate::format::ChdrFormat;
use crate::header::PacketType;

/// Largest number of data words in one control transaction.
pub const MAX_CTRL_DATA: usize = 15;

const MAX_PORT: u16 = (1 << 10) - 1;
const MAX_SEQ_NUM: u8 = (1 << 6) - 1;
const MAX_ADDRESS: u32 = (1 << 20) - 1;

/// Control transaction opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CtrlOpCode {
    #[default]
    Sleep = 0x0,
    Write = 0x1,
    Read = 0x2,
    ReadWrite = 0x3,
    BlockWrite = 0x4,
    BlockRead = 0x5,
    Poll = 0x6,
    User1 = 0xA,
    User2 = 0xB,
    User3 = 0xC,
    User4 = 0xD,
    User5 = 0xE,
    User6 = 0xF,
}

impl TryFrom<u8> for CtrlOpCode {
    type Error = PacketError;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0x0 => CtrlOpCode::Sleep,
            0x1 => CtrlOpCode::Write,
            0x2 => CtrlOpCode::Read,
            0x3 => CtrlOpCode::ReadWrite,
            0x4 => CtrlOpCode::BlockWrite,
            0x5 => CtrlOpCode::BlockRead,
            0x6 => CtrlOpCode::Poll,
            0xA => CtrlOpCode::User1,
            0xB => CtrlOpCode::User2,
            0xC => CtrlOpCode::User3,
            0xD => CtrlOpCode::User4,
            0xE => CtrlOpCode::User5,
            0xF => CtrlOpCode::User6,
            other => {
                return Err(PacketError::InvalidPayload(format!(
                    "invalid control opcode {other:#x}"
                )))
            }
        })
    }
}

/// Completion status of a control transaction.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CtrlStatus {
    #[default]
    Okay = 0,
    /// The command could not be executed.
    CmdErr = 1,
    /// The command's timestamp was in the past.
    TsErr = 2,
    Warning = 3,
}

impl From<u8> for CtrlStatus {
    fn from(code: u8) -> Self {
        match code & 0x3 {
            0 => CtrlStatus::Okay,
            1 => CtrlStatus::CmdErr,
            2 => CtrlStatus::TsErr,
            _ => CtrlStatus::Warning,
        }
    }
}

/// Control (register access) transaction.
///
/// ```text
/// word 0   src_epid[47:32] is_ack[31] has_time[30] seq_num[29:24]
///          num_data[23:20] src_port[19:10] dst_port[9:0]
/// [word 1] timestamp
/// op word  data0[63:32] status[31:30] op_code[27:24] byte_enable[23:20]
///          address[19:0]
/// rest     data[i] in the low half, data[i+1] in the high half
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtrlPayload {
    pub dst_port: u16,
    pub src_port: u16,
    /// 6-bit transaction sequence number.
    pub seq_num: u8,
    pub timestamp: Option<u64>,
    pub is_ack: bool,
    pub src_epid: u16,
    /// 20-bit byte address.
    pub address: u32,
    /// One to fifteen data words.
    pub data: Vec<u32>,
    /// 4-bit byte lane enable.
    pub byte_enable: u8,
    pub op_code: CtrlOpCode,
    pub status: CtrlStatus,
}

impl Default for CtrlPayload {
    fn default() -> Self {
        Self {
            dst_port: 0,
            src_port: 0,
            seq_num: 0,
            timestamp: None,
            is_ack: false,
            src_epid: 0,
            address: 0,
            data: Vec::new(),
            byte_enable: 0xF,
            op_code: CtrlOpCode::Sleep,
            status: CtrlStatus::Okay,
        }
    }
}

impl CtrlPayload {
    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PacketError::InvalidPayload(msg));
        if self.data.is_empty() || self.data.len() > MAX_CTRL_DATA {
            return invalid(format!(
                "control payload needs 1..={MAX_CTRL_DATA} data words, got {}",
                self.data.len()
            ));
        }
        if self.dst_port > MAX_PORT || self.src_port > MAX_PORT {
            return invalid(format!(
                "control port out of range (dst {}, src {})",
                self.dst_port, self.src_port
            ));
        }
        if self.seq_num > MAX_SEQ_NUM {
            return invalid(format!("control sequence number {} exceeds 6 bits", self.seq_num));
        }
        if self.address > MAX_ADDRESS {
            return invalid(format!("control address {:#x} exceeds 20 bits", self.address));
        }
        if self.byte_enable > 0xF {
            return invalid(format!("byte enable {:#x} exceeds 4 bits", self.byte_enable));
        }
        Ok(())
    }
}

impl ChdrPayload for CtrlPayload {
    const PACKET_TYPE: PacketType = PacketType::Ctrl;

    fn serialize(&self, dst: &mut [u8], format: &ChdrFormat) -> Result<usize> {
        self.validate()?;
        let mut writer = WordWriter::new(dst, format.endianness);

        writer.put_word(
            place(u64::from(self.dst_port), 0, 10)
                | place(u64::from(self.src_port), 10, 10)
                | place(self.data.len() as u64, 20, 4)
                | place(u64::from(self.seq_num), 24, 6)
                | place(u64::from(self.timestamp.is_some()), 30, 1)
                | place(u64::from(self.is_ack), 31, 1)
                | place(u64::from(self.src_epid), 32, 16),
        )?;
        if let Some(ts) = self.timestamp {
            writer.put_word(ts)?;
        }
        writer.put_word(
            place(u64::from(self.address), 0, 20)
                | place(u64::from(self.byte_enable), 20, 4)
                | place(self.op_code as u64, 24, 4)
                | place(self.status as u64, 30, 2)
                | place(u64::from(self.data[0]), 32, 32),
        )?;
        for pair in self.data[1..].chunks(2) {
            let lo = u64::from(pair[0]);
            let hi = pair.get(1).copied().map_or(0, u64::from);
            writer.put_word(lo | (hi << 32))?;
        }
        Ok(writer.written())
    }

    fn deserialize(src: &[u8], format: &ChdrFormat) -> Result<Self> {
        let mut reader = WordReader::new(src, format.endianness);

        let word0 = reader.next_word()?;
        let num_data = field(word0, 20, 4) as usize;
        if num_data == 0 {
            return Err(PacketError::InvalidPayload(
                "control payload carries no data words".to_string(),
            ));
        }
        let timestamp = if field(word0, 30, 1) == 1 {
            Some(reader.next_word()?)
        } else {
            None
        };

        let op_word = reader.next_word()?;
        let mut data = Vec::with_capacity(num_data);
        data.push(field(op_word, 32, 32) as u32);
        while data.len() < num_data {
            let word = reader.next_word()?;
            data.push(word as u32);
            if data.len() < num_data {
                data.push((word >> 32) as u32);
            }
        }

        Ok(Self {
            dst_port: field(word0, 0, 10) as u16,
            src_port: field(word0, 10, 10) as u16,
            seq_num: field(word0, 24, 6) as u8,
            timestamp,
            is_ack: field(word0, 31, 1) == 1,
            src_epid: field(word0, 32, 16) as u16,
            address: field(op_word, 0, 20) as u32,
            data,
            byte_enable: field(op_word, 20, 4) as u8,
            op_code: CtrlOpCode::try_from(field(op_word, 24, 4) as u8)?,
            status: CtrlStatus::from(field(op_word, 30, 2) as u8),
        })
    }

    fn length_words(&self, _format: &ChdrFormat) -> usize {
        1 + usize::from(self.timestamp.is_some()) + (self.data.len() + 2) / 2
    }
}
