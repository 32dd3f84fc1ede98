use super::{field, place, ChdrPayload, WordReader, WordWriter};
use crate::error::{PacketError, Result};
use crate::format::{ChdrFormat, ChdrWidth};
use crate::header::{ChdrHeader, PacketType};

/// Management protocol version sent by default.
pub const DEFAULT_PROTOVER: u16 = 0x0100;

const MAX_HOPS: usize = (1 << 10) - 1;
const MAX_OPS_PER_HOP: usize = 256;

/// Management operation codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MgmtOpCode {
    #[default]
    Nop = 0,
    /// Ask the node to advertise itself to the requester.
    Advertise = 1,
    /// Select the output port of a crossbar.
    SelDest = 2,
    /// Return the packet to the sender.
    Return = 3,
    InfoReq = 4,
    InfoResp = 5,
    CfgWrReq = 6,
    CfgRdReq = 7,
    CfgRdResp = 8,
}

impl TryFrom<u8> for MgmtOpCode {
    type Error = PacketError;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0 => MgmtOpCode::Nop,
            1 => MgmtOpCode::Advertise,
            2 => MgmtOpCode::SelDest,
            3 => MgmtOpCode::Return,
            4 => MgmtOpCode::InfoReq,
            5 => MgmtOpCode::InfoResp,
            6 => MgmtOpCode::CfgWrReq,
            7 => MgmtOpCode::CfgRdReq,
            8 => MgmtOpCode::CfgRdResp,
            other => {
                return Err(PacketError::InvalidPayload(format!(
                    "invalid management opcode {other}"
                )))
            }
        })
    }
}

/// Register access carried by `CfgWrReq`, `CfgRdReq` and `CfgRdResp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CfgPayload {
    pub addr: u16,
    pub data: u32,
}

impl CfgPayload {
    fn pack(self) -> u64 {
        u64::from(self.addr) | (u64::from(self.data) << 16)
    }

    fn unpack(payload: u64) -> Self {
        Self {
            addr: payload as u16,
            data: (payload >> 16) as u32,
        }
    }
}

/// Node description carried by `InfoReq` and `InfoResp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeInfoPayload {
    pub device_id: u16,
    /// 4-bit node type.
    pub node_type: u8,
    /// 10-bit node instance.
    pub node_inst: u16,
    /// 18-bit extended info.
    pub ext_info: u32,
}

impl NodeInfoPayload {
    fn pack(self) -> u64 {
        place(u64::from(self.device_id), 0, 16)
            | place(u64::from(self.node_type), 16, 4)
            | place(u64::from(self.node_inst), 20, 10)
            | place(u64::from(self.ext_info), 30, 18)
    }

    fn unpack(payload: u64) -> Self {
        Self {
            device_id: field(payload, 0, 16) as u16,
            node_type: field(payload, 16, 4) as u8,
            node_inst: field(payload, 20, 10) as u16,
            ext_info: field(payload, 30, 18) as u32,
        }
    }
}

/// One management operation: an opcode and a 48-bit argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MgmtOp {
    pub op_code: MgmtOpCode,
    pub op_payload: u64,
}

impl MgmtOp {
    /// Create an operation with a raw payload.
    pub fn new(op_code: MgmtOpCode, op_payload: u64) -> Self {
        Self {
            op_code,
            op_payload: op_payload & ((1 << 48) - 1),
        }
    }

    pub fn nop() -> Self {
        Self::new(MgmtOpCode::Nop, 0)
    }

    pub fn advertise() -> Self {
        Self::new(MgmtOpCode::Advertise, 0)
    }

    pub fn sel_dest(dest: u16) -> Self {
        Self::new(MgmtOpCode::SelDest, u64::from(dest))
    }

    pub fn ret() -> Self {
        Self::new(MgmtOpCode::Return, 0)
    }

    pub fn info_req(info: NodeInfoPayload) -> Self {
        Self::new(MgmtOpCode::InfoReq, info.pack())
    }

    pub fn info_resp(info: NodeInfoPayload) -> Self {
        Self::new(MgmtOpCode::InfoResp, info.pack())
    }

    pub fn cfg_wr_req(addr: u16, data: u32) -> Self {
        Self::new(MgmtOpCode::CfgWrReq, CfgPayload { addr, data }.pack())
    }

    pub fn cfg_rd_req(addr: u16) -> Self {
        Self::new(MgmtOpCode::CfgRdReq, CfgPayload { addr, data: 0 }.pack())
    }

    pub fn cfg_rd_resp(addr: u16, data: u32) -> Self {
        Self::new(MgmtOpCode::CfgRdResp, CfgPayload { addr, data }.pack())
    }

    /// Destination port of a `SelDest` operation.
    pub fn sel_dest_port(&self) -> u16 {
        self.op_payload as u16
    }

    /// Register access of a configuration operation.
    pub fn cfg(&self) -> CfgPayload {
        CfgPayload::unpack(self.op_payload)
    }

    /// Node description of an info operation.
    pub fn node_info(&self) -> NodeInfoPayload {
        NodeInfoPayload::unpack(self.op_payload)
    }
}

/// Operations executed by one node along the route.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MgmtHop {
    pub ops: Vec<MgmtOp>,
}

impl MgmtHop {
    pub fn new(ops: Vec<MgmtOp>) -> Self {
        Self { ops }
    }

    /// Append an operation.
    pub fn push(&mut self, op: MgmtOp) {
        self.ops.push(op);
    }
}

/// Management transaction: a list of hops, each a list of operations.
///
/// On links wider than 64 bits every word is followed by zero padding so
/// that each word starts a new link word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MgmtPayload {
    pub src_epid: u16,
    pub protover: u16,
    pub hops: Vec<MgmtHop>,
}

impl Default for MgmtPayload {
    fn default() -> Self {
        Self {
            src_epid: 0,
            protover: DEFAULT_PROTOVER,
            hops: Vec::new(),
        }
    }
}

fn padding_words(width: ChdrWidth) -> usize {
    width.bits() / 64 - 1
}

impl ChdrPayload for MgmtPayload {
    const PACKET_TYPE: PacketType = PacketType::Mgmt;

    fn serialize(&self, dst: &mut [u8], format: &ChdrFormat) -> Result<usize> {
        if self.hops.len() > MAX_HOPS {
            return Err(PacketError::InvalidPayload(format!(
                "{} hops exceed the 10-bit field",
                self.hops.len()
            )));
        }
        let padding = padding_words(format.width);
        let mut writer = WordWriter::new(dst, format.endianness);

        writer.put_word(
            place(u64::from(self.protover), 48, 16)
                | place(u64::from(format.width.code()), 45, 3)
                | place(self.hops.len() as u64, 16, 10)
                | place(u64::from(self.src_epid), 0, 16),
        )?;
        writer.put_zeros(padding)?;

        for hop in &self.hops {
            let num_ops = hop.ops.len();
            if num_ops == 0 || num_ops > MAX_OPS_PER_HOP {
                return Err(PacketError::InvalidPayload(format!(
                    "hop needs 1..={MAX_OPS_PER_HOP} operations, got {num_ops}"
                )));
            }
            for (i, op) in hop.ops.iter().enumerate() {
                writer.put_word(
                    place(op.op_payload, 16, 48)
                        | place(op.op_code as u64, 8, 8)
                        | place((num_ops - i - 1) as u64, 0, 8),
                )?;
                writer.put_zeros(padding)?;
            }
        }
        Ok(writer.written())
    }

    fn deserialize(src: &[u8], format: &ChdrFormat) -> Result<Self> {
        let padding = padding_words(format.width);
        let mut reader = WordReader::new(src, format.endianness);

        let header = reader.next_word()?;
        reader.skip_words(padding)?;
        let width = ChdrWidth::from_code(field(header, 45, 3) as u8)?;
        if width != format.width {
            return Err(PacketError::InvalidPayload(format!(
                "management payload built for {}-bit links received on a {}-bit link",
                width.bits(),
                format.width.bits()
            )));
        }

        let num_hops = field(header, 16, 10) as usize;
        let mut hops = Vec::with_capacity(num_hops);
        for _ in 0..num_hops {
            let mut hop = MgmtHop::default();
            loop {
                let word = reader.next_word()?;
                reader.skip_words(padding)?;
                hop.push(MgmtOp::new(
                    MgmtOpCode::try_from(field(word, 8, 8) as u8)?,
                    field(word, 16, 48),
                ));
                if field(word, 0, 8) == 0 {
                    break;
                }
            }
            hops.push(hop);
        }

        Ok(Self {
            src_epid: field(header, 0, 16) as u16,
            protover: field(header, 48, 16) as u16,
            hops,
        })
    }

    fn length_words(&self, format: &ChdrFormat) -> usize {
        let stride = 1 + padding_words(format.width);
        stride + self.hops.iter().map(|hop| hop.ops.len() * stride).sum::<usize>()
    }

    fn populate_header(&self, header: &mut ChdrHeader) {
        header.pkt_type = Self::PACKET_TYPE;
        header.flags = 0;
        header.num_mdata = 0;
        header.dst_epid = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Endianness;

    fn route() -> MgmtPayload {
        MgmtPayload {
            src_epid: 0x0002,
            protover: DEFAULT_PROTOVER,
            hops: vec![
                MgmtHop::new(vec![MgmtOp::sel_dest(3), MgmtOp::info_req(NodeInfoPayload::default())]),
                MgmtHop::new(vec![MgmtOp::cfg_wr_req(0x10, 0xDEAD_BEEF)]),
                MgmtHop::new(vec![MgmtOp::ret()]),
            ],
        }
    }

    #[test]
    fn test_round_trip_on_every_width() {
        for width in [ChdrWidth::W64, ChdrWidth::W128, ChdrWidth::W256, ChdrWidth::W512] {
            let format = ChdrFormat::new(width, Endianness::Big);
            let payload = route();
            let mut buf = vec![0u8; 1024];
            let written = payload.serialize(&mut buf, &format).expect("serialize should succeed");
            assert_eq!(written, payload.length_words(&format) * 8);

            let decoded =
                MgmtPayload::deserialize(&buf[..written], &format).expect("deserialize should succeed");
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn test_padding_is_zero_filled() {
        let format = ChdrFormat::new(ChdrWidth::W128, Endianness::Little);
        let payload = route();
        let mut buf = vec![0xFFu8; 256];
        let written = payload.serialize(&mut buf, &format).expect("serialize should succeed");
        for word in buf[..written].chunks(16) {
            assert_eq!(&word[8..], &[0u8; 8]);
        }
    }

    #[test]
    fn test_ops_remaining_counts_down() {
        let format = ChdrFormat::default();
        let payload = route();
        let mut buf = vec![0u8; 128];
        payload.serialize(&mut buf, &format).expect("serialize should succeed");
        let first_op = Endianness::Little.read_u64(&buf[8..16]);
        let second_op = Endianness::Little.read_u64(&buf[16..24]);
        assert_eq!(first_op & 0xFF, 1);
        assert_eq!(second_op & 0xFF, 0);
        assert_eq!((first_op >> 8) & 0xFF, MgmtOpCode::SelDest as u64);
    }

    #[test]
    fn test_op_helpers_decode() {
        let info = NodeInfoPayload {
            device_id: 0xABCD,
            node_type: 0x5,
            node_inst: 0x3FF,
            ext_info: 0x3FFFF,
        };
        assert_eq!(MgmtOp::info_resp(info).node_info(), info);
        assert_eq!(MgmtOp::sel_dest(7).sel_dest_port(), 7);
        let cfg = MgmtOp::cfg_rd_resp(0x20, 0x1234_5678).cfg();
        assert_eq!((cfg.addr, cfg.data), (0x20, 0x1234_5678));
    }

    #[test]
    fn test_empty_hop_rejected() {
        let format = ChdrFormat::default();
        let payload = MgmtPayload {
            hops: vec![MgmtHop::default()],
            ..MgmtPayload::default()
        };
        let mut buf = [0u8; 64];
        assert!(payload.serialize(&mut buf, &format).is_err());
    }

    #[test]
    fn test_width_mismatch_rejected() {
        let payload = route();
        let mut buf = vec![0u8; 512];
        let written = payload
            .serialize(&mut buf, &ChdrFormat::new(ChdrWidth::W64, Endianness::Little))
            .expect("serialize should succeed");
        let err = MgmtPayload::deserialize(
            &buf[..written],
            &ChdrFormat::new(ChdrWidth::W128, Endianness::Little),
        )
        .expect_err("width mismatch should fail");
        assert!(matches!(err, PacketError::InvalidPayload(_)));
    }

    #[test]
    fn test_populate_header_clears_destination() {
        let mut header = ChdrHeader {
            dst_epid: 9,
            num_mdata: 3,
            ..ChdrHeader::new(PacketType::Ctrl)
        };
        route().populate_header(&mut header);
        assert_eq!(header.pkt_type, PacketType::Mgmt);
        assert_eq!(header.dst_epid, 0);
        assert_eq!(header.num_mdata, 0);
    }
}
