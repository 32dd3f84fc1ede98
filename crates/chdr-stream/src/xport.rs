use std::time::Duration;

use chdr_packet::{ChdrFormat, ChdrPacket, PacketError, PacketType, StrcOpCode, StrcPayload};
use chdr_transport::{FrameBuff, RecvLink, SendLink};
use tracing::{debug, trace, warn};

use crate::error::{Result, StreamError};
use crate::flow::{RxFlowCtrlConfig, RxFlowCtrlSender, RxFlowCtrlState, StreamBuffParams};

/// Decoded view of a received data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub seq_num: u16,
    pub flags: u8,
    pub dst_epid: u16,
    /// Embedded timestamp, if the packet carries one.
    pub tsf: Option<u64>,
    pub num_mdata: u8,
    pub payload_offset: usize,
    pub payload_bytes: usize,
}

impl PacketInfo {
    /// Decode the header of a data packet.
    pub fn parse(format: ChdrFormat, bytes: &[u8]) -> std::result::Result<Self, PacketError> {
        let packet = ChdrPacket::parse(format, bytes)?;
        if !packet.header().pkt_type.is_data() {
            return Err(PacketError::InvalidPayload(format!(
                "{:?} packet on a data stream",
                packet.header().pkt_type
            )));
        }
        Ok(Self::from_packet(&packet))
    }

    fn from_packet(packet: &ChdrPacket<&[u8]>) -> Self {
        let header = packet.header();
        Self {
            seq_num: header.seq_num,
            flags: header.flags,
            dst_epid: header.dst_epid,
            tsf: packet.timestamp(),
            num_mdata: header.num_mdata,
            payload_offset: packet.format().payload_byte_offset(header),
            payload_bytes: packet.payload_bytes(),
        }
    }
}

/// A sequence number that did not follow its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqGap {
    pub expected: u16,
    pub received: u16,
}

/// A received data packet and the frame that holds it.
#[derive(Debug)]
pub struct RxPacket {
    pub buff: FrameBuff,
    pub info: PacketInfo,
    /// Set when packets were lost just before this one.
    pub seq_error: Option<SeqGap>,
}

impl RxPacket {
    /// The payload bytes.
    pub fn payload(&self) -> &[u8] {
        let start = self.info.payload_offset;
        &self.buff.packet()[start..start + self.info.payload_bytes]
    }
}

/// A source of data packets for one channel.
pub trait RxDataXport {
    /// Receive one data packet.
    ///
    /// Returns `Ok(None)` on timeout. A frame that fails to parse is
    /// released before the error is returned.
    fn get_recv_buff(&mut self, timeout: Duration) -> Result<Option<RxPacket>>;

    /// Return a packet's frame to the link.
    fn release_recv_buff(&mut self, buff: FrameBuff);
}

enum Frame {
    Data(PacketInfo),
    Command(StrcPayload),
    Foreign(u16),
}

struct FlowCtrl {
    send_link: Box<dyn SendLink>,
    local_epid: u16,
    state: RxFlowCtrlState,
    sender: RxFlowCtrlSender,
}

impl FlowCtrl {
    fn send_status(&mut self) -> Result<()> {
        self.sender
            .send_strs(self.send_link.as_mut(), self.state.xfer_counts())
    }

    fn send_status_if_due(&mut self) -> Result<()> {
        if self.state.fc_resp_due() {
            self.send_status()?;
            self.state.fc_resp_sent();
        }
        Ok(())
    }
}

/// Data transport over a CHDR receive link.
///
/// With flow control attached, the transport also consumes stream command
/// packets and reports released packets back to the sender with stream
/// status packets, and it discards packets addressed to other endpoints.
pub struct ChdrRxDataXport<L> {
    link: L,
    format: ChdrFormat,
    expected_seq: u16,
    fc: Option<FlowCtrl>,
}

impl<L: RecvLink> ChdrRxDataXport<L> {
    /// Wrap `link`. The first packet is expected to carry sequence number 0.
    pub fn new(link: L, format: ChdrFormat) -> Self {
        Self {
            link,
            format,
            expected_seq: 0,
            fc: None,
        }
    }

    /// Wrap `link` and answer the sender through `send_link`.
    pub fn with_flow_control<S>(link: L, format: ChdrFormat, send_link: S, config: RxFlowCtrlConfig) -> Self
    where
        S: SendLink + 'static,
    {
        Self {
            fc: Some(FlowCtrl {
                send_link: Box::new(send_link),
                local_epid: config.local_epid,
                state: RxFlowCtrlState::new(config.fc_freq),
                sender: RxFlowCtrlSender::new(format, &config),
            }),
            ..Self::new(link, format)
        }
    }

    /// The underlying link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Mutable access to the underlying link.
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Link format used to parse frames.
    pub fn format(&self) -> ChdrFormat {
        self.format
    }

    /// Flow control accounting, when flow control is attached.
    pub fn flow_ctrl_state(&self) -> Option<&RxFlowCtrlState> {
        self.fc.as_ref().map(|fc| &fc.state)
    }

    fn classify(&self, bytes: &[u8]) -> std::result::Result<Frame, PacketError> {
        let packet = ChdrPacket::parse(self.format, bytes)?;
        let header = packet.header();
        if let Some(fc) = &self.fc {
            if header.dst_epid != fc.local_epid {
                return Ok(Frame::Foreign(header.dst_epid));
            }
        }
        match header.pkt_type {
            PacketType::StreamCommand => Ok(Frame::Command(packet.payload_as()?)),
            pkt_type if pkt_type.is_data() => Ok(Frame::Data(PacketInfo::from_packet(&packet))),
            pkt_type => Err(PacketError::InvalidPayload(format!(
                "{pkt_type:?} packet on a data stream"
            ))),
        }
    }

    fn handle_strc(&mut self, strc: &StrcPayload, packet_size: usize) -> Result<()> {
        let Some(fc) = self.fc.as_mut() else {
            warn!(op = ?strc.op_code, "stream command on a transport without flow control");
            return Ok(());
        };

        let counts = StreamBuffParams::new(strc.num_bytes, strc.num_pkts as u32);
        match strc.op_code {
            StrcOpCode::Init => {
                fc.state.initialize(counts);
                debug!(bytes = counts.bytes, packets = counts.packets, "flow control initialized");
                fc.send_status()?;
                fc.state.reset_counts();
                Ok(())
            }
            StrcOpCode::Resync => {
                // The command carries the counts before itself.
                fc.state.resynchronize(counts);
                fc.state.data_received(packet_size);
                fc.state.xfer_done(packet_size);
                fc.send_status_if_due()
            }
            StrcOpCode::Ping => fc.send_status(),
        }
    }
}

impl<L: RecvLink> RxDataXport for ChdrRxDataXport<L> {
    fn get_recv_buff(&mut self, timeout: Duration) -> Result<Option<RxPacket>> {
        loop {
            let Some(buff) = self.link.get_recv_buff(timeout)? else {
                return Ok(None);
            };

            let frame = match self.classify(buff.packet()) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(len = buff.packet_size(), error = %err, "discarding malformed data packet");
                    self.link.release_recv_buff(buff);
                    return Err(StreamError::Packet(err));
                }
            };

            let info = match frame {
                Frame::Data(info) => info,
                Frame::Command(strc) => {
                    let size = buff.packet_size();
                    self.link.release_recv_buff(buff);
                    self.handle_strc(&strc, size)?;
                    continue;
                }
                Frame::Foreign(dst_epid) => {
                    trace!(dst_epid, "discarding packet for another endpoint");
                    self.link.release_recv_buff(buff);
                    continue;
                }
            };

            if let Some(fc) = self.fc.as_mut() {
                fc.state.data_received(buff.packet_size());
            }

            let seq_error = (info.seq_num != self.expected_seq).then_some(SeqGap {
                expected: self.expected_seq,
                received: info.seq_num,
            });
            if let Some(gap) = seq_error {
                trace!(expected = gap.expected, received = gap.received, "sequence gap");
            }
            self.expected_seq = info.seq_num.wrapping_add(1);

            return Ok(Some(RxPacket {
                buff,
                info,
                seq_error,
            }));
        }
    }

    fn release_recv_buff(&mut self, buff: FrameBuff) {
        let size = buff.packet_size();
        self.link.release_recv_buff(buff);
        if let Some(fc) = self.fc.as_mut() {
            fc.state.xfer_done(size);
            if let Err(err) = fc.send_status_if_due() {
                warn!(error = %err, "failed to send stream status");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chdr_packet::{ChdrHeader, ChdrWidth, Endianness, PacketType, StrsPayload};
    use chdr_transport::{
        mock_recv_link, mock_send_link, MockRecvHandle, MockRecvLink, MockSendHandle, TransportError,
    };

    pub(crate) fn format() -> ChdrFormat {
        ChdrFormat::new(ChdrWidth::W64, Endianness::Little)
    }

    /// Build one data packet with a 16-byte payload.
    pub(crate) fn data_packet(seq_num: u16, tsf: Option<u64>) -> Vec<u8> {
        data_packet_to(LOCAL_EPID, seq_num, tsf)
    }

    const LOCAL_EPID: u16 = 0;
    const REMOTE_EPID: u16 = 7;
    const DATA_PACKET_BYTES: u64 = 32;

    fn data_packet_to(dst_epid: u16, seq_num: u16, tsf: Option<u64>) -> Vec<u8> {
        let pkt_type = if tsf.is_some() {
            PacketType::DataWithTs
        } else {
            PacketType::DataNoTs
        };
        let header = ChdrHeader {
            seq_num,
            dst_epid,
            ..ChdrHeader::new(pkt_type)
        };
        let mut packet =
            ChdrPacket::init(format(), vec![0u8; 64], header, tsf).expect("init should succeed");
        packet.payload_capacity_mut()[..16].copy_from_slice(&[seq_num as u8; 16]);
        packet.update_payload_size(16).expect("payload should fit");
        let len = packet.packet_bytes();
        let mut bytes = packet.into_inner();
        bytes.truncate(len);
        bytes
    }

    pub(crate) fn xport() -> (ChdrRxDataXport<MockRecvLink>, MockRecvHandle) {
        let (link, handle) = mock_recv_link(4, 256);
        (ChdrRxDataXport::new(link, format()), handle)
    }

    fn strc_packet(op_code: StrcOpCode, num_pkts: u64, num_bytes: u64) -> Vec<u8> {
        let header = ChdrHeader {
            dst_epid: LOCAL_EPID,
            ..ChdrHeader::new(PacketType::StreamCommand)
        };
        let strc = StrcPayload {
            src_epid: REMOTE_EPID,
            op_code,
            num_pkts,
            num_bytes,
            ..StrcPayload::default()
        };
        let packet = ChdrPacket::init_with_payload(format(), vec![0u8; 64], header, &strc)
            .expect("command should encode");
        let len = packet.packet_bytes();
        let mut bytes = packet.into_inner();
        bytes.truncate(len);
        bytes
    }

    fn fc_xport(
        fc_freq_pkts: u32,
    ) -> (ChdrRxDataXport<MockRecvLink>, MockRecvHandle, MockSendHandle) {
        let (link, handle) = mock_recv_link(4, 256);
        let (send_link, sent) = mock_send_link(4, 256);
        let config = RxFlowCtrlConfig {
            local_epid: LOCAL_EPID,
            remote_epid: REMOTE_EPID,
            capacity: StreamBuffParams::new(1024, 4),
            fc_freq: StreamBuffParams::new(u64::MAX, fc_freq_pkts),
        };
        let xport = ChdrRxDataXport::with_flow_control(link, format(), send_link, config);
        (xport, handle, sent)
    }

    fn next_status(sent: &MockSendHandle) -> (u16, StrsPayload) {
        let bytes = sent.pop_packet().expect("a stream status should be sent");
        let packet = ChdrPacket::parse(format(), &bytes[..]).expect("status should parse");
        assert_eq!(packet.header().pkt_type, PacketType::StreamStatus);
        assert_eq!(packet.header().dst_epid, REMOTE_EPID);
        let strs: StrsPayload = packet.payload_as().expect("status should decode");
        (packet.header().seq_num, strs)
    }

    fn recv_and_release(xport: &mut ChdrRxDataXport<MockRecvLink>) -> PacketInfo {
        let packet = xport
            .get_recv_buff(Duration::ZERO)
            .expect("recv should succeed")
            .expect("packet should be queued");
        let info = packet.info;
        xport.release_recv_buff(packet.buff);
        info
    }

    #[test]
    fn test_decodes_data_packet() {
        let (mut xport, handle) = xport();
        handle.push_packet(data_packet(0, Some(1234)));

        let packet = xport
            .get_recv_buff(Duration::ZERO)
            .expect("recv should succeed")
            .expect("packet should be queued");
        assert_eq!(packet.info.tsf, Some(1234));
        assert_eq!(packet.info.payload_offset, 16);
        assert_eq!(packet.payload(), &[0u8; 16]);
        assert!(packet.seq_error.is_none());
        xport.release_recv_buff(packet.buff);
        assert_eq!(xport.link().frames_in_flight(), 0);
    }

    #[test]
    fn test_flags_sequence_gap() {
        let (mut xport, handle) = xport();
        handle.push_packet(data_packet(0, None));
        handle.push_packet(data_packet(3, None));
        handle.push_packet(data_packet(4, None));

        let mut gaps = Vec::new();
        for _ in 0..3 {
            let packet = xport
                .get_recv_buff(Duration::ZERO)
                .expect("recv should succeed")
                .expect("packet should be queued");
            gaps.push(packet.seq_error);
            xport.release_recv_buff(packet.buff);
        }
        assert_eq!(
            gaps,
            vec![
                None,
                Some(SeqGap {
                    expected: 1,
                    received: 3
                }),
                None
            ]
        );
    }

    #[test]
    fn test_sequence_wraps() {
        let (mut xport, handle) = xport();
        for seq in [0u16, 1] {
            handle.push_packet(data_packet(seq, None));
        }
        for _ in 0..2 {
            let packet = xport
                .get_recv_buff(Duration::ZERO)
                .expect("recv should succeed")
                .expect("packet should be queued");
            xport.release_recv_buff(packet.buff);
        }
        xport.expected_seq = u16::MAX;
        handle.push_packet(data_packet(u16::MAX, None));
        handle.push_packet(data_packet(0, None));
        for _ in 0..2 {
            let packet = xport
                .get_recv_buff(Duration::ZERO)
                .expect("recv should succeed")
                .expect("packet should be queued");
            assert!(packet.seq_error.is_none());
            xport.release_recv_buff(packet.buff);
        }
    }

    #[test]
    fn test_malformed_frame_released() {
        let (mut xport, handle) = xport();
        handle.push_packet(vec![0u8; 4]);
        let err = xport
            .get_recv_buff(Duration::ZERO)
            .expect_err("truncated frame should fail");
        assert!(matches!(err, StreamError::Packet(PacketError::Truncated { .. })));
        assert_eq!(xport.link().frames_in_flight(), 0);
    }

    #[test]
    fn test_non_data_packet_rejected() {
        let (mut xport, handle) = xport();
        let header = ChdrHeader {
            length: 16,
            ..ChdrHeader::new(PacketType::Ctrl)
        };
        let mut bytes = vec![0u8; 16];
        format().write_header(&mut bytes, &header).expect("write should succeed");
        handle.push_packet(bytes);

        assert!(xport.get_recv_buff(Duration::ZERO).is_err());
        assert_eq!(xport.link().frames_in_flight(), 0);
    }

    #[test]
    fn test_exhausted_pool_is_an_error() {
        let (mut xport, handle) = xport();
        for seq in 0..5 {
            handle.push_packet(data_packet(seq, None));
        }
        let held: Vec<_> = (0..4)
            .map(|_| {
                xport
                    .get_recv_buff(Duration::ZERO)
                    .expect("recv should succeed")
                    .expect("packet should be queued")
            })
            .collect();

        let err = xport
            .get_recv_buff(Duration::ZERO)
            .expect_err("a fifth frame should not be available");
        assert!(matches!(
            err,
            StreamError::Transport(TransportError::PoolExhausted { capacity: 4 })
        ));

        for packet in held {
            xport.release_recv_buff(packet.buff);
        }
        assert_eq!(recv_and_release(&mut xport).seq_num, 4);
    }

    #[test]
    fn test_status_sent_every_fc_freq_packets() {
        let (mut xport, handle, sent) = fc_xport(2);
        for seq in 0..5 {
            handle.push_packet(data_packet(seq, None));
        }

        recv_and_release(&mut xport);
        assert_eq!(sent.pending(), 0);
        recv_and_release(&mut xport);
        let (seq, strs) = next_status(&sent);
        assert_eq!(seq, 0);
        assert_eq!(strs.src_epid, LOCAL_EPID);
        assert_eq!(strs.capacity_pkts, 4);
        assert_eq!(strs.capacity_bytes, 1024);
        assert_eq!(strs.xfer_count_pkts, 2);
        assert_eq!(strs.xfer_count_bytes, 2 * DATA_PACKET_BYTES);

        recv_and_release(&mut xport);
        recv_and_release(&mut xport);
        let (seq, strs) = next_status(&sent);
        assert_eq!(seq, 1);
        assert_eq!(strs.xfer_count_pkts, 4);

        recv_and_release(&mut xport);
        assert_eq!(sent.pending(), 0);
        let state = xport.flow_ctrl_state().expect("flow control should be attached");
        assert_eq!(state.recv_counts(), StreamBuffParams::new(5 * DATA_PACKET_BYTES, 5));
    }

    #[test]
    fn test_status_waits_for_release() {
        let (mut xport, handle, sent) = fc_xport(1);
        handle.push_packet(data_packet(0, None));

        let packet = xport
            .get_recv_buff(Duration::ZERO)
            .expect("recv should succeed")
            .expect("packet should be queued");
        assert_eq!(sent.pending(), 0);
        xport.release_recv_buff(packet.buff);
        assert_eq!(next_status(&sent).1.xfer_count_pkts, 1);
    }

    #[test]
    fn test_resync_command_is_absorbed() {
        let (mut xport, handle, sent) = fc_xport(8);
        handle.push_packet(data_packet(0, None));
        recv_and_release(&mut xport);

        // The sender has sent three data packets; two of them were lost.
        let strc = strc_packet(StrcOpCode::Resync, 3, 3 * DATA_PACKET_BYTES);
        let strc_bytes = strc.len() as u64;
        handle.push_packet(strc);
        handle.push_packet(data_packet(3, None));

        let info = recv_and_release(&mut xport);
        assert_eq!(info.seq_num, 3);

        let state = xport.flow_ctrl_state().expect("flow control should be attached");
        assert_eq!(state.recv_counts().packets, 5);
        assert_eq!(state.xfer_counts().packets, 5);
        assert_eq!(
            state.xfer_counts().bytes,
            4 * DATA_PACKET_BYTES + strc_bytes
        );
        assert_eq!(sent.pending(), 0);
        assert_eq!(xport.link().frames_in_flight(), 0);
    }

    #[test]
    fn test_resync_reports_when_due() {
        let (mut xport, handle, sent) = fc_xport(4);
        handle.push_packet(strc_packet(StrcOpCode::Resync, 3, 3 * DATA_PACKET_BYTES));

        let idle = xport
            .get_recv_buff(Duration::ZERO)
            .expect("a command alone should not be an error");
        assert!(idle.is_none());
        let (seq, strs) = next_status(&sent);
        assert_eq!(seq, 0);
        assert_eq!(strs.xfer_count_pkts, 4);
    }

    #[test]
    fn test_init_command_sets_frequency_and_responds() {
        let (mut xport, handle, sent) = fc_xport(100);
        handle.push_packet(data_packet(0, None));
        recv_and_release(&mut xport);

        handle.push_packet(strc_packet(StrcOpCode::Init, 1, u64::MAX));
        handle.push_packet(data_packet(1, None));
        recv_and_release(&mut xport);

        let (seq, strs) = next_status(&sent);
        assert_eq!(seq, 0);
        assert_eq!(strs.xfer_count_pkts, 1, "init reports the counts before the reset");
        let (seq, strs) = next_status(&sent);
        assert_eq!(seq, 1);
        assert_eq!(strs.xfer_count_pkts, 1);

        let state = xport.flow_ctrl_state().expect("flow control should be attached");
        assert_eq!(state.fc_freq(), StreamBuffParams::new(u64::MAX, 1));
    }

    #[test]
    fn test_ping_command_answers_with_status() {
        let (mut xport, handle, sent) = fc_xport(100);
        handle.push_packet(strc_packet(StrcOpCode::Ping, 0, 0));
        assert!(xport
            .get_recv_buff(Duration::ZERO)
            .expect("ping should not be an error")
            .is_none());
        assert_eq!(next_status(&sent).1.xfer_count_pkts, 0);
    }

    #[test]
    fn test_packets_for_other_endpoints_discarded() {
        let (mut xport, handle, sent) = fc_xport(1);
        handle.push_packet(data_packet_to(LOCAL_EPID + 1, 0, None));
        handle.push_packet(data_packet(0, None));

        let info = recv_and_release(&mut xport);
        assert_eq!(info.dst_epid, LOCAL_EPID);
        let state = xport.flow_ctrl_state().expect("flow control should be attached");
        assert_eq!(state.recv_counts().packets, 1);
        assert_eq!(next_status(&sent).1.xfer_count_pkts, 1);
        assert_eq!(xport.link().frames_in_flight(), 0);
    }

    #[test]
    fn test_command_without_flow_control_is_ignored() {
        let (mut xport, handle) = xport();
        handle.push_packet(strc_packet(StrcOpCode::Resync, 3, 96));
        handle.push_packet(data_packet(0, None));

        assert_eq!(recv_and_release(&mut xport).seq_num, 0);
        assert_eq!(xport.link().frames_in_flight(), 0);
    }

    #[test]
    fn test_timeout_is_not_an_error() {
        let (mut xport, _handle) = xport();
        let result = xport
            .get_recv_buff(Duration::from_millis(5))
            .expect("timeout should not be an error");
        assert!(result.is_none());
    }
}
