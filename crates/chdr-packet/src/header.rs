use crate::error::{PacketError, Result};

const FLAGS_OFFSET: u32 = 58;
const FLAGS_MASK: u64 = 0x3F;
const PKT_TYPE_OFFSET: u32 = 55;
const PKT_TYPE_MASK: u64 = 0x7;
const NUM_MDATA_OFFSET: u32 = 48;
const NUM_MDATA_MASK: u64 = 0x7F;
const SEQ_NUM_OFFSET: u32 = 32;
const LENGTH_OFFSET: u32 = 16;

/// Largest value the 6-bit flags field holds.
pub const MAX_FLAGS: u8 = FLAGS_MASK as u8;

/// Largest value the 7-bit metadata count field holds.
pub const MAX_NUM_MDATA: u8 = NUM_MDATA_MASK as u8;

/// CHDR packet types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PacketType {
    /// Management (topology discovery and configuration).
    #[default]
    Mgmt = 0x0,
    /// Stream status.
    StreamStatus = 0x1,
    /// Stream command.
    StreamCommand = 0x2,
    /// Control (register access).
    Ctrl = 0x4,
    /// Data without timestamp.
    DataNoTs = 0x6,
    /// Data with timestamp.
    DataWithTs = 0x7,
}

impl PacketType {
    /// Whether this is one of the two data packet types.
    pub fn is_data(self) -> bool {
        matches!(self, PacketType::DataNoTs | PacketType::DataWithTs)
    }
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0x0 => Ok(PacketType::Mgmt),
            0x1 => Ok(PacketType::StreamStatus),
            0x2 => Ok(PacketType::StreamCommand),
            0x4 => Ok(PacketType::Ctrl),
            0x6 => Ok(PacketType::DataNoTs),
            0x7 => Ok(PacketType::DataWithTs),
            other => Err(PacketError::InvalidPacketType(other)),
        }
    }
}

/// Decoded CHDR header word.
///
/// Fields hold host-native values; byte order is applied only when the
/// word is written to or read from a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChdrHeader {
    /// Virtual-channel and end-of-burst style flags (6 bits).
    pub flags: u8,
    /// Packet type (3 bits).
    pub pkt_type: PacketType,
    /// Number of metadata words (7 bits).
    pub num_mdata: u8,
    /// Sequence number.
    pub seq_num: u16,
    /// Total packet length in bytes, header included.
    pub length: u16,
    /// Destination endpoint ID.
    pub dst_epid: u16,
}

impl ChdrHeader {
    /// Create a header of the given type with every other field zeroed.
    pub fn new(pkt_type: PacketType) -> Self {
        Self {
            pkt_type,
            ..Self::default()
        }
    }

    /// Pack into a 64-bit word. Out-of-range `flags` and `num_mdata` bits
    /// are truncated to their field width.
    pub fn pack(&self) -> u64 {
        ((u64::from(self.flags) & FLAGS_MASK) << FLAGS_OFFSET)
            | ((self.pkt_type as u64 & PKT_TYPE_MASK) << PKT_TYPE_OFFSET)
            | ((u64::from(self.num_mdata) & NUM_MDATA_MASK) << NUM_MDATA_OFFSET)
            | (u64::from(self.seq_num) << SEQ_NUM_OFFSET)
            | (u64::from(self.length) << LENGTH_OFFSET)
            | u64::from(self.dst_epid)
    }

    /// Unpack a 64-bit word. Fails only on a reserved packet type code.
    pub fn unpack(word: u64) -> Result<Self> {
        let pkt_type = PacketType::try_from(((word >> PKT_TYPE_OFFSET) & PKT_TYPE_MASK) as u8)?;
        Ok(Self {
            flags: ((word >> FLAGS_OFFSET) & FLAGS_MASK) as u8,
            pkt_type,
            num_mdata: ((word >> NUM_MDATA_OFFSET) & NUM_MDATA_MASK) as u8,
            seq_num: (word >> SEQ_NUM_OFFSET) as u16,
            length: (word >> LENGTH_OFFSET) as u16,
            dst_epid: word as u16,
        })
    }
}

impl std::fmt::Display for ChdrHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} flags={:#x} num_mdata={} seq={} len={} dst_epid={}",
            self.pkt_type, self.flags, self.num_mdata, self.seq_num, self.length, self.dst_epid
        )
    }
}
