use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chdr_packet::{ChdrFormat, ChdrHeader, ChdrPacket, CtrlPayload, PacketType};
use chdr_transport::{RecvLink, SendLink, TransportError};
use tracing::{debug, error, trace, warn};

use crate::ctrlport::{CtrlportEndpoint, CtrlportPolicy, SendFn};
use crate::error::{CtrlError, Result};

/// Highest control port number (10-bit field).
pub const MAX_PORT: u16 = 0x3FF;

/// Configuration for a [`CtrlEndpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtrlEndpointConfig {
    /// Pause of the receive thread when the link has nothing queued.
    pub idle_sleep: Duration,
    /// Policy given to newly created ctrlport endpoints.
    pub default_policy: CtrlportPolicy,
}

impl Default for CtrlEndpointConfig {
    fn default() -> Self {
        Self {
            idle_sleep: Duration::from_micros(10),
            default_policy: CtrlportPolicy::default(),
        }
    }
}

struct EndpointState {
    ports: HashMap<u16, Arc<CtrlportEndpoint>>,
    send_seq: u16,
    send_link: Box<dyn SendLink>,
}

struct Shared {
    state: Mutex<EndpointState>,
    format: ChdrFormat,
    my_epid: u16,
    dst_epid: u16,
    config: CtrlEndpointConfig,
    stop: AtomicBool,
    drops: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, payload: &CtrlPayload, timeout: Duration) -> Result<()> {
        let mut state = self.lock();
        let Some(mut buff) = state.send_link.get_send_buff(timeout)? else {
            return Err(CtrlError::SendBuffUnavailable(timeout));
        };

        let header = ChdrHeader {
            seq_num: state.send_seq,
            dst_epid: self.dst_epid,
            ..ChdrHeader::new(PacketType::Ctrl)
        };
        let built = ChdrPacket::init_with_payload(self.format, buff.data_mut(), header, payload)
            .map(|packet| packet.packet_bytes());
        let size = match built {
            Ok(size) => size,
            Err(err) => {
                buff.set_packet_size(0);
                state.send_link.release_send_buff(buff)?;
                return Err(err.into());
            }
        };

        buff.set_packet_size(size);
        state.send_link.release_send_buff(buff)?;
        trace!(seq = state.send_seq, dst_epid = self.dst_epid, len = size, "sent control packet");
        state.send_seq = state.send_seq.wrapping_add(1);
        Ok(())
    }

    fn dispatch(&self, bytes: &[u8]) -> Result<()> {
        let packet = ChdrPacket::parse(self.format, bytes)?;
        let payload: CtrlPayload = packet.payload_as()?;
        let port = self
            .lock()
            .ports
            .get(&payload.dst_port)
            .cloned()
            .ok_or(CtrlError::UnknownPort(payload.dst_port))?;
        port.handle_recv(&payload);
        Ok(())
    }

    fn record_drop(&self, err: &dyn std::fmt::Display) {
        let drops = self.drops.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(epid = self.my_epid, drops, error = %err, "dropped control packet");
    }
}

fn run_worker(shared: Arc<Shared>, mut recv_link: Box<dyn RecvLink>) -> Box<dyn RecvLink> {
    debug!(epid = shared.my_epid, "control receive thread started");
    while !shared.stop.load(Ordering::Acquire) {
        match recv_link.get_recv_buff(Duration::ZERO) {
            Ok(Some(buff)) => {
                if let Err(err) = shared.dispatch(buff.packet()) {
                    shared.record_drop(&err);
                }
                recv_link.release_recv_buff(buff);
            }
            Ok(None) => thread::sleep(shared.config.idle_sleep),
            Err(err) => {
                shared.record_drop(&err);
                thread::sleep(shared.config.idle_sleep);
            }
        }
    }
    debug!(epid = shared.my_epid, "control receive thread stopped");
    recv_link
}

/// Control-plane endpoint between one local and one remote endpoint ID.
///
/// Owns the link pair. A background thread polls the receive link and
/// routes each control packet to the [`CtrlportEndpoint`] registered for
/// its destination port. Packets for unknown ports and packets that fail
/// to parse are dropped, logged and counted in [`CtrlEndpoint::num_drops`].
pub struct CtrlEndpoint {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<Box<dyn RecvLink>>>,
}

impl CtrlEndpoint {
    /// Take ownership of the links and start the receive thread.
    pub fn new<S, R>(
        send_link: S,
        recv_link: R,
        format: ChdrFormat,
        my_epid: u16,
        dst_epid: u16,
        config: CtrlEndpointConfig,
    ) -> Result<Self>
    where
        S: SendLink + 'static,
        R: RecvLink + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(EndpointState {
                ports: HashMap::new(),
                send_seq: 0,
                send_link: Box::new(send_link),
            }),
            format,
            my_epid,
            dst_epid,
            config,
            stop: AtomicBool::new(false),
            drops: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let recv_link: Box<dyn RecvLink> = Box::new(recv_link);
        let worker = thread::Builder::new()
            .name(format!("chdr-ctrl-{my_epid:04x}"))
            .spawn(move || run_worker(worker_shared, recv_link))
            .map_err(TransportError::Io)?;

        debug!(my_epid, dst_epid, "created control endpoint");
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Get the ctrlport endpoint for `port`, creating it on first use.
    ///
    /// Later calls for the same port return the existing endpoint and
    /// ignore the buffer arguments.
    pub fn get_ctrlport_ep(
        &self,
        port: u16,
        buff_capacity: usize,
        max_outstanding_async_msgs: usize,
    ) -> Result<Arc<CtrlportEndpoint>> {
        if port > MAX_PORT {
            return Err(CtrlError::InvalidArgument(format!(
                "control port {port} exceeds {MAX_PORT}"
            )));
        }

        let mut state = self.shared.lock();
        if let Some(ep) = state.ports.get(&port) {
            return Ok(Arc::clone(ep));
        }

        let link = Arc::downgrade(&self.shared);
        let send_fn: SendFn = Box::new(move |payload, timeout| {
            link.upgrade()
                .ok_or(CtrlError::Shutdown)?
                .send(payload, timeout)
        });
        let ep = Arc::new(CtrlportEndpoint::new(
            send_fn,
            self.shared.my_epid,
            port,
            buff_capacity,
            max_outstanding_async_msgs,
            self.shared.config.default_policy,
        ));
        state.ports.insert(port, Arc::clone(&ep));
        debug!(
            epid = self.shared.my_epid,
            port, buff_capacity, max_outstanding_async_msgs, "created ctrlport endpoint"
        );
        Ok(ep)
    }

    /// Send one control payload to the remote endpoint.
    ///
    /// Returns once the packet is committed to the send link; replies
    /// arrive through the receive thread.
    pub fn send(&self, payload: &CtrlPayload, timeout: Duration) -> Result<()> {
        self.shared.send(payload, timeout)
    }

    /// Control packets dropped by the receive thread.
    pub fn num_drops(&self) -> u64 {
        self.shared.drops.load(Ordering::Relaxed)
    }

    /// Number of registered ctrlport endpoints.
    pub fn num_ports(&self) -> usize {
        self.shared.lock().ports.len()
    }

    /// Whether the receive thread is still polling.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }

    pub fn my_epid(&self) -> u16 {
        self.shared.my_epid
    }

    pub fn dst_epid(&self) -> u16 {
        self.shared.dst_epid
    }

    pub fn format(&self) -> ChdrFormat {
        self.shared.format
    }
}

impl Drop for CtrlEndpoint {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(mut recv_link) => {
                    let mut drained = 0usize;
                    while let Ok(Some(buff)) = recv_link.get_recv_buff(Duration::ZERO) {
                        recv_link.release_recv_buff(buff);
                        drained += 1;
                    }
                    if drained > 0 {
                        debug!(epid = self.shared.my_epid, drained, "drained receive link");
                    }
                }
                Err(_) => error!(epid = self.shared.my_epid, "control receive thread panicked"),
            }
        }
        self.shared.lock().ports.clear();
    }
}

impl std::fmt::Debug for CtrlEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtrlEndpoint")
            .field("my_epid", &self.shared.my_epid)
            .field("dst_epid", &self.shared.dst_epid)
            .field("format", &self.shared.format)
            .field("drops", &self.num_drops())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::RegisterIface;
    use chdr_packet::{ChdrWidth, CtrlOpCode, Endianness};
    use chdr_transport::{mock_recv_link, mock_send_link, MockRecvHandle, MockSendHandle};
    use std::time::Instant;

    const MY_EPID: u16 = 0x10;
    const DEV_EPID: u16 = 0x20;

    fn format() -> ChdrFormat {
        ChdrFormat::new(ChdrWidth::W64, Endianness::Little)
    }

    fn endpoint() -> (CtrlEndpoint, MockSendHandle, MockRecvHandle) {
        let (send_link, sent) = mock_send_link(8, 256);
        let (recv_link, incoming) = mock_recv_link(8, 256);
        let config = CtrlEndpointConfig {
            idle_sleep: Duration::from_micros(50),
            default_policy: CtrlportPolicy {
                timeout: Duration::from_millis(500),
                force_acks: false,
            },
        };
        let ep = CtrlEndpoint::new(send_link, recv_link, format(), MY_EPID, DEV_EPID, config)
            .expect("endpoint should start");
        (ep, sent, incoming)
    }

    fn encode(payload: &CtrlPayload, seq_num: u16) -> Vec<u8> {
        let header = ChdrHeader {
            seq_num,
            dst_epid: MY_EPID,
            ..ChdrHeader::new(PacketType::Ctrl)
        };
        let packet = ChdrPacket::init_with_payload(format(), vec![0u8; 256], header, payload)
            .expect("encode should succeed");
        let len = packet.packet_bytes();
        let mut bytes = packet.into_inner();
        bytes.truncate(len);
        bytes
    }

    fn decode(bytes: &[u8]) -> (ChdrHeader, CtrlPayload) {
        let packet = ChdrPacket::parse(format(), bytes).expect("packet should parse");
        let payload = packet.payload_as().expect("payload should decode");
        (*packet.header(), payload)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Answer every request: reads return `!address`, writes are echoed.
    fn spawn_device(sent: MockSendHandle, incoming: MockRecvHandle, requests: usize) -> JoinHandle<()> {
        thread::spawn(move || {
            for seq in 0..requests {
                let bytes = sent
                    .pop_packet_timeout(Duration::from_secs(2))
                    .expect("device should receive a request");
                let (_, request) = decode(&bytes);
                let mut ack = CtrlPayload {
                    is_ack: true,
                    src_epid: DEV_EPID,
                    ..request
                };
                if ack.op_code == CtrlOpCode::Read {
                    ack.data = vec![!ack.address];
                }
                incoming.push_packet(encode(&ack, seq as u16));
            }
        })
    }

    #[test]
    fn test_get_ctrlport_ep_is_idempotent() {
        let (ep, _sent, _incoming) = endpoint();
        let first = ep.get_ctrlport_ep(2, 64, 1).expect("create should succeed");
        let second = ep.get_ctrlport_ep(2, 128, 4).expect("lookup should succeed");
        let other = ep.get_ctrlport_ep(3, 64, 1).expect("create should succeed");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(first.port_num(), 2);
        assert_eq!(first.src_epid(), MY_EPID);
        assert_eq!(ep.num_ports(), 2);
        assert!(ep.is_running());
    }

    #[test]
    fn test_port_out_of_range() {
        let (ep, _sent, _incoming) = endpoint();
        let err = ep
            .get_ctrlport_ep(MAX_PORT + 1, 64, 1)
            .expect_err("port beyond 10 bits should fail");
        assert!(matches!(err, CtrlError::InvalidArgument(_)));
    }

    #[test]
    fn test_send_sequence_is_gap_free_under_concurrency() {
        let (ep, sent, _incoming) = endpoint();
        let ep = Arc::new(ep);

        let senders: Vec<_> = (0..4u32)
            .map(|t| {
                let ep = Arc::clone(&ep);
                thread::spawn(move || {
                    for i in 0..50u32 {
                        let payload = CtrlPayload {
                            address: t * 1000 + i,
                            data: vec![i],
                            ..CtrlPayload::default()
                        };
                        ep.send(&payload, Duration::from_millis(100))
                            .expect("send should succeed");
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.join().expect("sender should finish");
        }

        let mut seqs = Vec::new();
        while let Some(bytes) = sent.pop_packet() {
            let (header, _) = decode(&bytes);
            assert_eq!(header.dst_epid, DEV_EPID);
            assert_eq!(header.pkt_type, PacketType::Ctrl);
            seqs.push(header.seq_num);
        }
        assert_eq!(seqs, (0..200u16).collect::<Vec<_>>());
    }

    #[test]
    fn test_drops_are_counted() {
        let (ep, _sent, incoming) = endpoint();
        let _port = ep.get_ctrlport_ep(1, 64, 1).expect("create should succeed");

        incoming.push_packet(vec![0u8; 4]);
        let stray = CtrlPayload {
            dst_port: 9,
            is_ack: true,
            data: vec![0],
            ..CtrlPayload::default()
        };
        incoming.push_packet(encode(&stray, 0));

        wait_for(|| ep.num_drops() == 2);
        assert!(ep.is_running());
    }

    #[test]
    fn test_register_access_through_device() {
        let (ep, sent, incoming) = endpoint();
        let port = ep.get_ctrlport_ep(4, 64, 0).expect("create should succeed");
        let device = spawn_device(sent, incoming, 3);

        port.poke32(0x100, 0xBEEF, None, true).expect("acked poke should succeed");
        assert_eq!(port.peek32(0x104, None).expect("peek should succeed"), !0x104);
        port.poke32(0x108, 1, Some(5000), true).expect("timed poke should succeed");

        device.join().expect("device should finish");
        assert_eq!(port.num_outstanding(), 0);
        assert_eq!(ep.num_drops(), 0);
    }

    #[test]
    fn test_async_message_is_acknowledged() {
        let (ep, sent, incoming) = endpoint();
        let port = ep.get_ctrlport_ep(6, 64, 2).expect("create should succeed");
        let (tx, rx) = std::sync::mpsc::channel();
        port.register_async_msg_handler(Arc::new(move |addr, data, _ts| {
            let _ = tx.send((addr, data.to_vec()));
        }));

        let msg = CtrlPayload {
            dst_port: 6,
            src_port: 1,
            src_epid: DEV_EPID,
            address: 0x40,
            data: vec![3, 4],
            op_code: CtrlOpCode::Write,
            ..CtrlPayload::default()
        };
        incoming.push_packet(encode(&msg, 0));

        let (addr, data) = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("handler should run");
        assert_eq!((addr, data), (0x40, vec![3, 4]));

        let bytes = sent
            .pop_packet_timeout(Duration::from_secs(2))
            .expect("ACK should be sent");
        let (header, ack) = decode(&bytes);
        assert_eq!(header.dst_epid, DEV_EPID);
        assert!(ack.is_ack);
        assert_eq!(ack.src_epid, MY_EPID);
        assert_eq!(ack.address, 0x40);
    }

    #[test]
    fn test_ctrlport_outliving_endpoint_reports_shutdown() {
        let (ep, _sent, incoming) = endpoint();
        let port = ep.get_ctrlport_ep(1, 64, 0).expect("create should succeed");
        incoming.push_packet(vec![0u8; 4]);
        drop(ep);

        let err = port
            .poke32(0, 0, None, false)
            .expect_err("send after shutdown should fail");
        assert!(matches!(err, CtrlError::Shutdown));
    }

    /// Withholds queued packets from the first thread that polls (the
    /// receive thread) and counts every frame released back.
    struct HeldBackHooks {
        queue: Arc<Mutex<Vec<Vec<u8>>>>,
        polls: Arc<AtomicU64>,
        releases: Arc<AtomicU64>,
        rx_thread: Option<thread::ThreadId>,
    }

    impl chdr_transport::RecvHooks for HeldBackHooks {
        fn get_recv_buff_derived(
            &mut self,
            buff: &mut chdr_transport::FrameBuff,
            _timeout: Duration,
        ) -> chdr_transport::Result<usize> {
            self.polls.fetch_add(1, Ordering::Relaxed);
            let current = thread::current().id();
            if *self.rx_thread.get_or_insert(current) == current {
                return Ok(0);
            }
            let Some(bytes) = self.queue.lock().expect("queue lock should not be poisoned").pop() else {
                return Ok(0);
            };
            buff.data_mut()[..bytes.len()].copy_from_slice(&bytes);
            Ok(bytes.len())
        }

        fn release_recv_buff_derived(&mut self, _buff: &mut chdr_transport::FrameBuff) {
            self.releases.fetch_add(1, Ordering::Relaxed);
        }

        fn supports_out_of_order(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_drop_drains_receive_link() {
        let queue = Arc::new(Mutex::new(vec![vec![0u8; 16]; 3]));
        let polls = Arc::new(AtomicU64::new(0));
        let releases = Arc::new(AtomicU64::new(0));
        let recv_link = chdr_transport::RecvLinkBase::new(
            4,
            256,
            HeldBackHooks {
                queue: Arc::clone(&queue),
                polls: Arc::clone(&polls),
                releases: Arc::clone(&releases),
                rx_thread: None,
            },
        );
        let (send_link, _sent) = mock_send_link(8, 256);
        let ep = CtrlEndpoint::new(
            send_link,
            recv_link,
            format(),
            MY_EPID,
            DEV_EPID,
            CtrlEndpointConfig::default(),
        )
        .expect("endpoint should start");

        wait_for(|| polls.load(Ordering::Relaxed) > 0);
        assert_eq!(releases.load(Ordering::Relaxed), 0);

        drop(ep);
        assert_eq!(releases.load(Ordering::Relaxed), 3);
        assert!(queue.lock().expect("queue lock should not be poisoned").is_empty());
    }
}
