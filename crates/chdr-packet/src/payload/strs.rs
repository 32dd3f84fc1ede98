use super::{field, place, ChdrPayload, WordReader, WordWriter};
use crate::error::{PacketError, Result};
use crate::format::ChdrFormat;
use crate::header::PacketType;

const STRS_WORDS: usize = 4;

/// Stream endpoint status code.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StrsStatus {
    #[default]
    Okay = 0,
    /// A stream command could not be executed.
    CmdErr = 1,
    /// A packet arrived out of sequence.
    SeqErr = 2,
    /// A data packet was malformed.
    DataErr = 3,
    /// A packet was routed to the wrong endpoint.
    RtErr = 4,
}

impl TryFrom<u8> for StrsStatus {
    type Error = PacketError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(StrsStatus::Okay),
            1 => Ok(StrsStatus::CmdErr),
            2 => Ok(StrsStatus::SeqErr),
            3 => Ok(StrsStatus::DataErr),
            4 => Ok(StrsStatus::RtErr),
            other => Err(PacketError::InvalidPayload(format!("invalid stream status {other}"))),
        }
    }
}

/// Stream status: flow-control feedback from a stream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StrsPayload {
    pub src_epid: u16,
    pub status: StrsStatus,
    /// Downstream buffer capacity in bytes (40 bits).
    pub capacity_bytes: u64,
    /// Downstream buffer capacity in packets (24 bits).
    pub capacity_pkts: u32,
    /// Packets consumed so far (40 bits).
    pub xfer_count_pkts: u64,
    /// Bytes consumed so far.
    pub xfer_count_bytes: u64,
    pub buff_info: u16,
    /// Status-specific diagnostic (48 bits).
    pub status_info: u64,
}

impl ChdrPayload for StrsPayload {
    const PACKET_TYPE: PacketType = PacketType::StreamStatus;

    fn serialize(&self, dst: &mut [u8], format: &ChdrFormat) -> Result<usize> {
        let mut writer = WordWriter::new(dst, format.endianness);
        writer.put_word(
            place(u64::from(self.src_epid), 0, 16)
                | place(self.status as u64, 16, 4)
                | place(self.capacity_bytes, 24, 40),
        )?;
        writer.put_word(
            place(u64::from(self.capacity_pkts), 0, 24) | place(self.xfer_count_pkts, 24, 40),
        )?;
        writer.put_word(self.xfer_count_bytes)?;
        writer.put_word(place(u64::from(self.buff_info), 0, 16) | place(self.status_info, 16, 48))?;
        Ok(writer.written())
    }

    fn deserialize(src: &[u8], format: &ChdrFormat) -> Result<Self> {
        let mut reader = WordReader::new(src, format.endianness);
        let w0 = reader.next_word()?;
        let w1 = reader.next_word()?;
        let w2 = reader.next_word()?;
        let w3 = reader.next_word()?;
        Ok(Self {
            src_epid: field(w0, 0, 16) as u16,
            status: StrsStatus::try_from(field(w0, 16, 4) as u8)?,
            capacity_bytes: field(w0, 24, 40),
            capacity_pkts: field(w1, 0, 24) as u32,
            xfer_count_pkts: field(w1, 24, 40),
            xfer_count_bytes: w2,
            buff_info: field(w3, 0, 16) as u16,
            status_info: field(w3, 16, 48),
        })
    }

    fn length_words(&self, _format: &ChdrFormat) -> usize {
        STRS_WORDS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ChdrWidth, Endianness};

    #[test]
    fn test_round_trip_at_field_limits() {
        let format = ChdrFormat::new(ChdrWidth::W64, Endianness::Big);
        let payload = StrsPayload {
            src_epid: 0xFFFF,
            status: StrsStatus::RtErr,
            capacity_bytes: (1 << 40) - 1,
            capacity_pkts: (1 << 24) - 1,
            xfer_count_pkts: (1 << 40) - 1,
            xfer_count_bytes: u64::MAX,
            buff_info: 0xFFFF,
            status_info: (1 << 48) - 1,
        };
        let mut buf = [0u8; 32];
        let written = payload.serialize(&mut buf, &format).expect("serialize should succeed");
        assert_eq!(written, 32);
        let decoded = StrsPayload::deserialize(&buf, &format).expect("deserialize should succeed");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_invalid_status_rejected() {
        let format = ChdrFormat::default();
        let mut buf = [0u8; 32];
        Endianness::Little.write_u64(&mut buf[0..8], 9 << 16);
        assert!(StrsPayload::deserialize(&buf, &format).is_err());
    }

    #[test]
    fn test_short_buffer_rejected() {
        let format = ChdrFormat::default();
        let mut buf = [0u8; 24];
        assert!(StrsPayload::default().serialize(&mut buf, &format).is_err());
        assert!(StrsPayload::deserialize(&buf, &format).is_err());
    }
}
