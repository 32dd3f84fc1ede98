//! In-memory link backend.
//!
//! The send side records every committed packet; the receive side replays
//! packets injected through a [`MockRecvHandle`]. Both halves are cheap to
//! share across threads, which makes them suitable for simulating a device
//! in tests of the layers above.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::trace;

use crate::buffer::FrameBuff;
use crate::error::{Result, TransportError};
use crate::link::{RecvHooks, RecvLinkBase, SendHooks, SendLinkBase};

/// Send link that records committed packets.
pub type MockSendLink = SendLinkBase<MockSendHooks>;

/// Receive link fed from a [`MockRecvHandle`].
pub type MockRecvLink = RecvLinkBase<MockRecvHooks>;

#[derive(Default)]
struct PacketQueue {
    packets: Mutex<VecDeque<Bytes>>,
    ready: Condvar,
}

impl PacketQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Bytes>> {
        self.packets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, packet: Bytes) {
        self.lock().push_back(packet);
        self.ready.notify_all();
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<Bytes> {
        let deadline = Instant::now() + timeout;
        let mut packets = self.lock();
        loop {
            if let Some(packet) = packets.pop_front() {
                return Some(packet);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            packets = self
                .ready
                .wait_timeout(packets, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Create an in-memory send link and the handle that observes it.
pub fn mock_send_link(num_frames: usize, frame_size: usize) -> (MockSendLink, MockSendHandle) {
    let queue = Arc::new(PacketQueue::default());
    let hooks = MockSendHooks {
        sent: Arc::clone(&queue),
        out_of_order: false,
    };
    (
        SendLinkBase::new(num_frames, frame_size, hooks),
        MockSendHandle { sent: queue },
    )
}

/// Create an in-memory receive link and the handle that feeds it.
pub fn mock_recv_link(num_frames: usize, frame_size: usize) -> (MockRecvLink, MockRecvHandle) {
    let queue = Arc::new(PacketQueue::default());
    let hooks = MockRecvHooks {
        incoming: Arc::clone(&queue),
        out_of_order: false,
    };
    (
        RecvLinkBase::new(num_frames, frame_size, hooks),
        MockRecvHandle { incoming: queue },
    )
}

/// Observer of the packets committed to a [`MockSendLink`].
#[derive(Clone)]
pub struct MockSendHandle {
    sent: Arc<PacketQueue>,
}

impl MockSendHandle {
    /// Take the oldest committed packet, if any.
    pub fn pop_packet(&self) -> Option<Bytes> {
        self.sent.lock().pop_front()
    }

    /// Wait up to `timeout` for a committed packet.
    pub fn pop_packet_timeout(&self, timeout: Duration) -> Option<Bytes> {
        self.sent.pop_timeout(timeout)
    }

    /// Number of committed packets not yet taken.
    pub fn pending(&self) -> usize {
        self.sent.lock().len()
    }
}

/// Feeder of the packets delivered by a [`MockRecvLink`].
#[derive(Clone)]
pub struct MockRecvHandle {
    incoming: Arc<PacketQueue>,
}

impl MockRecvHandle {
    /// Queue one packet for delivery.
    pub fn push_packet(&self, packet: impl Into<Bytes>) {
        self.incoming.push(packet.into());
    }

    /// Number of queued packets not yet received.
    pub fn pending(&self) -> usize {
        self.incoming.lock().len()
    }
}

/// Send hooks of the in-memory backend.
pub struct MockSendHooks {
    sent: Arc<PacketQueue>,
    out_of_order: bool,
}

impl MockSendHooks {
    /// Set the out-of-order release capability reported by the link.
    pub fn set_out_of_order(&mut self, enabled: bool) {
        self.out_of_order = enabled;
    }
}

impl SendHooks for MockSendHooks {
    fn release_send_buff_derived(&mut self, buff: &mut FrameBuff) -> Result<()> {
        trace!(len = buff.packet_size(), "mock link committed packet");
        self.sent.push(Bytes::copy_from_slice(buff.packet()));
        Ok(())
    }

    fn supports_out_of_order(&self) -> bool {
        self.out_of_order
    }
}

/// Receive hooks of the in-memory backend.
pub struct MockRecvHooks {
    incoming: Arc<PacketQueue>,
    out_of_order: bool,
}

impl MockRecvHooks {
    /// Set the out-of-order release capability reported by the link.
    pub fn set_out_of_order(&mut self, enabled: bool) {
        self.out_of_order = enabled;
    }
}

impl RecvHooks for MockRecvHooks {
    fn get_recv_buff_derived(&mut self, buff: &mut FrameBuff, timeout: Duration) -> Result<usize> {
        let Some(packet) = self.incoming.pop_timeout(timeout) else {
            return Ok(0);
        };
        if packet.len() > buff.capacity() {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "injected packet of {} bytes exceeds frame size {}",
                    packet.len(),
                    buff.capacity()
                ),
            )));
        }
        buff.data_mut()[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    fn supports_out_of_order(&self) -> bool {
        self.out_of_order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{RecvLink, SendLink};

    #[test]
    fn test_committed_packets_are_observable() {
        let (mut link, handle) = mock_send_link(2, 32);
        let mut buff = link
            .get_send_buff(Duration::ZERO)
            .expect("get should succeed")
            .expect("frame should be available");
        buff.data_mut()[..3].copy_from_slice(b"abc");
        buff.set_packet_size(3);
        link.release_send_buff(buff).expect("release should succeed");

        assert_eq!(handle.pending(), 1);
        assert_eq!(handle.pop_packet().as_deref(), Some(&b"abc"[..]));
        assert!(handle.pop_packet().is_none());
    }

    #[test]
    fn test_injected_packets_are_received_in_order() {
        let (mut link, handle) = mock_recv_link(4, 32);
        handle.push_packet(vec![1u8, 2]);
        handle.push_packet(vec![3u8]);

        let first = link
            .get_recv_buff(Duration::ZERO)
            .expect("recv should succeed")
            .expect("packet should be queued");
        let second = link
            .get_recv_buff(Duration::ZERO)
            .expect("recv should succeed")
            .expect("packet should be queued");
        assert_eq!(first.packet(), &[1, 2]);
        assert_eq!(second.packet(), &[3]);

        link.release_recv_buff(second);
        link.release_recv_buff(first);
        assert!(link
            .get_recv_buff(Duration::ZERO)
            .expect("recv should succeed")
            .is_none());
    }

    #[test]
    fn test_recv_waits_for_packet_from_another_thread() {
        let (mut link, handle) = mock_recv_link(1, 16);
        let feeder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.push_packet(vec![7u8; 4]);
        });

        let buff = link
            .get_recv_buff(Duration::from_secs(2))
            .expect("recv should succeed")
            .expect("packet should arrive");
        assert_eq!(buff.packet_size(), 4);
        link.release_recv_buff(buff);
        feeder.join().expect("feeder thread should finish");
    }

    #[test]
    fn test_oversized_packet_is_an_error() {
        let (mut link, handle) = mock_recv_link(1, 4);
        handle.push_packet(vec![0u8; 8]);
        assert!(link.get_recv_buff(Duration::ZERO).is_err());
        assert_eq!(link.frames_in_flight(), 0);
    }

    #[test]
    fn test_out_of_order_capability_is_configurable() {
        let (mut link, _handle) = mock_recv_link(1, 4);
        assert!(!link.supports_recv_buff_out_of_order());
        link.hooks_mut().set_out_of_order(true);
        assert!(link.supports_recv_buff_out_of_order());
    }
}
