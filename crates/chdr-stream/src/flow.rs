use std::time::Duration;

use chdr_packet::{ChdrFormat, ChdrHeader, ChdrPacket, PacketType, StrsPayload, StrsStatus};
use chdr_transport::SendLink;
use tracing::trace;

use crate::error::{Result, StreamError};

/// A byte and packet count pair, as carried by stream status and stream
/// command packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamBuffParams {
    pub bytes: u64,
    pub packets: u32,
}

impl StreamBuffParams {
    pub const fn new(bytes: u64, packets: u32) -> Self {
        Self { bytes, packets }
    }
}

/// Receive-side flow control settings of a data transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxFlowCtrlConfig {
    /// Endpoint ID data packets are addressed to.
    pub local_epid: u16,
    /// Endpoint ID of the sender, the destination of stream status packets.
    pub remote_epid: u16,
    /// Buffer capacity advertised to the sender.
    pub capacity: StreamBuffParams,
    /// Consumed bytes or packets between two status reports. A stream
    /// command `Init` replaces it.
    pub fc_freq: StreamBuffParams,
}

/// Transfer accounting of a flow-controlled receive stream.
///
/// `recv` counts what arrived on the link, `xfer` what the consumer has
/// released. A status report is due once `xfer` has advanced by `fc_freq`
/// bytes or packets since the last report.
#[derive(Debug, Clone, Default)]
pub struct RxFlowCtrlState {
    fc_freq: StreamBuffParams,
    recv_counts: StreamBuffParams,
    xfer_counts: StreamBuffParams,
    last_resp_counts: StreamBuffParams,
}

impl RxFlowCtrlState {
    pub fn new(fc_freq: StreamBuffParams) -> Self {
        Self {
            fc_freq,
            ..Self::default()
        }
    }

    /// Set the reporting frequency.
    pub fn initialize(&mut self, fc_freq: StreamBuffParams) {
        self.fc_freq = fc_freq;
    }

    /// Align the receive counts with the sender's view.
    ///
    /// Packets the sender counted but that never arrived are treated as
    /// consumed, so the sender gets their buffer space back.
    pub fn resynchronize(&mut self, counts: StreamBuffParams) {
        if counts == self.recv_counts {
            return;
        }
        let dropped_bytes = counts.bytes.wrapping_sub(self.recv_counts.bytes);
        let dropped_packets = counts.packets.wrapping_sub(self.recv_counts.packets);
        trace!(dropped_bytes, dropped_packets, "resynchronizing flow control counts");
        self.recv_counts = counts;
        self.xfer_counts.bytes = self.xfer_counts.bytes.wrapping_add(dropped_bytes);
        self.xfer_counts.packets = self.xfer_counts.packets.wrapping_add(dropped_packets);
    }

    /// Record a packet taken off the link.
    pub fn data_received(&mut self, bytes: usize) {
        self.recv_counts.bytes = self.recv_counts.bytes.wrapping_add(bytes as u64);
        self.recv_counts.packets = self.recv_counts.packets.wrapping_add(1);
    }

    /// Record a packet released by the consumer.
    pub fn xfer_done(&mut self, bytes: usize) {
        self.xfer_counts.bytes = self.xfer_counts.bytes.wrapping_add(bytes as u64);
        self.xfer_counts.packets = self.xfer_counts.packets.wrapping_add(1);
    }

    pub fn fc_resp_due(&self) -> bool {
        let bytes = self.xfer_counts.bytes.wrapping_sub(self.last_resp_counts.bytes);
        let packets = self.xfer_counts.packets.wrapping_sub(self.last_resp_counts.packets);
        bytes >= self.fc_freq.bytes || packets >= self.fc_freq.packets
    }

    pub fn fc_resp_sent(&mut self) {
        self.last_resp_counts = self.xfer_counts;
    }

    pub fn xfer_counts(&self) -> StreamBuffParams {
        self.xfer_counts
    }

    pub fn recv_counts(&self) -> StreamBuffParams {
        self.recv_counts
    }

    pub fn fc_freq(&self) -> StreamBuffParams {
        self.fc_freq
    }

    /// Zero every count, keeping the frequency.
    pub fn reset_counts(&mut self) {
        self.recv_counts = StreamBuffParams::default();
        self.xfer_counts = StreamBuffParams::default();
        self.last_resp_counts = StreamBuffParams::default();
    }
}

/// Builds and sends stream status packets.
#[derive(Debug, Clone)]
pub struct RxFlowCtrlSender {
    format: ChdrFormat,
    dst_epid: u16,
    template: StrsPayload,
    seq_num: u16,
}

impl RxFlowCtrlSender {
    pub fn new(format: ChdrFormat, config: &RxFlowCtrlConfig) -> Self {
        Self {
            format,
            dst_epid: config.remote_epid,
            template: StrsPayload {
                src_epid: config.local_epid,
                status: StrsStatus::Okay,
                capacity_bytes: config.capacity.bytes,
                capacity_pkts: config.capacity.packets,
                ..StrsPayload::default()
            },
            seq_num: 0,
        }
    }

    /// Sequence number of the next status packet.
    pub fn next_seq_num(&self) -> u16 {
        self.seq_num
    }

    /// Send one status packet reporting `counts` as consumed.
    pub fn send_strs(&mut self, link: &mut dyn SendLink, counts: StreamBuffParams) -> Result<()> {
        let Some(mut buff) = link.get_send_buff(Duration::ZERO)? else {
            return Err(StreamError::FlowCtrlBuffUnavailable);
        };

        let header = ChdrHeader {
            seq_num: self.seq_num,
            dst_epid: self.dst_epid,
            ..ChdrHeader::new(PacketType::StreamStatus)
        };
        let payload = StrsPayload {
            xfer_count_bytes: counts.bytes,
            xfer_count_pkts: u64::from(counts.packets),
            ..self.template
        };
        let built = ChdrPacket::init_with_payload(self.format, buff.data_mut(), header, &payload)
            .map(|packet| packet.packet_bytes());
        let size = match built {
            Ok(size) => size,
            Err(err) => {
                link.release_send_buff(buff)?;
                return Err(err.into());
            }
        };

        buff.set_packet_size(size);
        link.release_send_buff(buff)?;
        trace!(
            seq = self.seq_num,
            bytes = counts.bytes,
            packets = counts.packets,
            "sent stream status"
        );
        self.seq_num = self.seq_num.wrapping_add(1);
        Ok(())
    }
}
