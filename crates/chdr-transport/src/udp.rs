use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::buffer::FrameBuff;
use crate::error::{Result, TransportError};
use crate::link::{RecvHooks, RecvLinkBase, SendHooks, SendLinkBase};
use crate::params::LinkParams;

/// Send direction of a UDP link.
pub type UdpSendLink = SendLinkBase<UdpSendHooks>;

/// Receive direction of a UDP link.
pub type UdpRecvLink = RecvLinkBase<UdpRecvHooks>;

/// UDP link construction.
///
/// Both directions share one connected socket: every datagram is one CHDR
/// packet and only datagrams from the connected peer are received. The
/// socket stays in blocking mode; zero-timeout polls use a per-call
/// non-blocking receive.
pub struct UdpLink;

impl UdpLink {
    /// Bind an ephemeral local port and connect it to `remote`.
    pub fn connect(remote: SocketAddr, params: &LinkParams) -> Result<(UdpSendLink, UdpRecvLink)> {
        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).map_err(|e| TransportError::Bind {
            addr: local,
            source: e,
        })?;
        socket.connect(remote).map_err(|e| TransportError::Connect {
            addr: remote,
            source: e,
        })?;
        Self::from_socket(socket, params)
    }

    /// Build a link over an already connected socket.
    pub fn from_socket(socket: UdpSocket, params: &LinkParams) -> Result<(UdpSendLink, UdpRecvLink)> {
        params.validate()?;

        if let Some(size) = params.recv_buff_size {
            set_socket_buff_size(&socket, SocketBuff::Recv, size)?;
        }
        if let Some(size) = params.send_buff_size {
            set_socket_buff_size(&socket, SocketBuff::Send, size)?;
        }

        let local = socket.local_addr()?;
        let peer = socket.peer_addr()?;
        let recv_socket = socket.try_clone()?;

        info!(%local, %peer, "udp link connected");

        let send = SendLinkBase::new(
            params.num_send_frames,
            params.send_frame_size,
            UdpSendHooks { socket },
        );
        let recv = RecvLinkBase::new(
            params.num_recv_frames,
            params.recv_frame_size,
            UdpRecvHooks {
                socket: recv_socket,
                timeout: None,
            },
        );
        Ok((send, recv))
    }
}

/// Commits frames with `send` on the connected socket.
pub struct UdpSendHooks {
    socket: UdpSocket,
}

impl UdpSendHooks {
    /// Local address of the socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Into::into)
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.socket.peer_addr().map_err(Into::into)
    }
}

impl SendHooks for UdpSendHooks {
    fn release_send_buff_derived(&mut self, buff: &mut FrameBuff) -> Result<()> {
        loop {
            match self.socket.send(buff.packet()) {
                Ok(sent) if sent == buff.packet_size() => return Ok(()),
                Ok(sent) => {
                    return Err(TransportError::Io(std::io::Error::new(
                        ErrorKind::WriteZero,
                        format!("short datagram: sent {sent} of {} bytes", buff.packet_size()),
                    )))
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn supports_out_of_order(&self) -> bool {
        true
    }
}

/// Fills frames with `recv` on the connected socket.
pub struct UdpRecvHooks {
    socket: UdpSocket,
    timeout: Option<Duration>,
}

impl UdpRecvHooks {
    /// Local address of the socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Into::into)
    }

    /// Receive one datagram, waiting at most `timeout`.
    ///
    /// Never changes the descriptor's non-blocking flag, which the send
    /// half shares.
    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        #[cfg(unix)]
        {
            if timeout.is_zero() {
                return recv_dontwait(&self.socket, buf);
            }
        }
        #[cfg(not(unix))]
        let timeout = timeout.max(Duration::from_millis(1));

        if self.timeout != Some(timeout) {
            self.socket.set_read_timeout(Some(timeout))?;
            self.timeout = Some(timeout);
        }
        self.socket.recv(buf)
    }
}

impl RecvHooks for UdpRecvHooks {
    fn get_recv_buff_derived(&mut self, buff: &mut FrameBuff, timeout: Duration) -> Result<usize> {
        match self.recv_timeout(buff.data_mut(), timeout) {
            Ok(len) => Ok(len),
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn supports_out_of_order(&self) -> bool {
        true
    }
}

#[cfg(unix)]
fn recv_dontwait(socket: &UdpSocket, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::os::fd::AsRawFd;

    // SAFETY: `buf` is writable for `buf.len()` bytes and the descriptor is
    // owned by `socket` for the duration of the call.
    let rc = unsafe {
        libc::recv(
            socket.as_raw_fd(),
            buf.as_mut_ptr().cast::<libc::c_void>(),
            buf.len(),
            libc::MSG_DONTWAIT,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(rc as usize)
}

#[derive(Debug, Clone, Copy)]
enum SocketBuff {
    Recv,
    Send,
}

#[cfg(unix)]
fn set_socket_buff_size(socket: &UdpSocket, which: SocketBuff, size: usize) -> Result<()> {
    use std::os::fd::AsRawFd;

    let fd = socket.as_raw_fd();
    let option = match which {
        SocketBuff::Recv => libc::SO_RCVBUF,
        SocketBuff::Send => libc::SO_SNDBUF,
    };
    let requested = libc::c_int::try_from(size).map_err(|_| {
        TransportError::InvalidParams(format!("socket buffer size {size} out of range"))
    })?;

    // SAFETY: `requested` is a valid readable c_int for the provided size,
    // and `fd` is an open socket descriptor owned by `socket`.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            (&requested as *const libc::c_int).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let mut actual: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `actual` and `len` are valid writable pointers for the provided sizes.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            (&mut actual as *mut libc::c_int).cast::<libc::c_void>(),
            &mut len,
        )
    };
    if rc == 0 {
        if (actual as usize) < size {
            warn!(?which, requested = size, actual, "socket buffer smaller than requested");
        } else {
            debug!(?which, requested = size, actual, "socket buffer size set");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_socket_buff_size(_socket: &UdpSocket, which: SocketBuff, size: usize) -> Result<()> {
    debug!(?which, requested = size, "socket buffer sizing not supported on this platform");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{RecvLink, SendLink};

    fn device_socket() -> UdpSocket {
        UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("device socket should bind")
    }

    fn small_params() -> LinkParams {
        LinkParams {
            num_recv_frames: 4,
            recv_frame_size: 1024,
            num_send_frames: 4,
            send_frame_size: 1024,
            ..LinkParams::default()
        }
    }

    #[test]
    fn test_send_and_receive_over_loopback() {
        let device = device_socket();
        let device_addr = device.local_addr().expect("device addr should resolve");
        let (mut send, mut recv) =
            UdpLink::connect(device_addr, &small_params()).expect("link should connect");

        let mut buff = send
            .get_send_buff(Duration::from_millis(100))
            .expect("get should succeed")
            .expect("frame should be available");
        buff.data_mut()[..5].copy_from_slice(b"hello");
        buff.set_packet_size(5);
        send.release_send_buff(buff).expect("send should succeed");

        let mut scratch = [0u8; 64];
        device
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout should apply");
        let (len, host_addr) = device.recv_from(&mut scratch).expect("device should receive");
        assert_eq!(&scratch[..len], b"hello");

        let host_port = send.hooks().local_addr().expect("local addr should be known").port();
        assert_eq!(host_addr.port(), host_port);
        device
            .send_to(b"world!", (Ipv4Addr::LOCALHOST, host_port))
            .expect("device should reply");

        let buff = recv
            .get_recv_buff(Duration::from_secs(2))
            .expect("recv should succeed")
            .expect("reply should arrive");
        assert_eq!(buff.packet(), b"world!");
        recv.release_recv_buff(buff);
        assert_eq!(recv.frames_in_flight(), 0);
    }

    #[test]
    fn test_poll_without_data_times_out() {
        let device = device_socket();
        let (_send, mut recv) = UdpLink::connect(
            device.local_addr().expect("device addr should resolve"),
            &small_params(),
        )
        .expect("link should connect");

        let result = recv.get_recv_buff(Duration::ZERO).expect("poll should succeed");
        assert!(result.is_none());
        let result = recv
            .get_recv_buff(Duration::from_millis(20))
            .expect("timed recv should succeed");
        assert!(result.is_none());
        assert_eq!(recv.frames_in_flight(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_zero_timeout_poll_leaves_sender_blocking() {
        use std::os::fd::AsRawFd;

        let device = device_socket();
        let (mut send, mut recv) = UdpLink::connect(
            device.local_addr().expect("device addr should resolve"),
            &small_params(),
        )
        .expect("link should connect");

        for _ in 0..3 {
            let result = recv.get_recv_buff(Duration::ZERO).expect("poll should succeed");
            assert!(result.is_none());
        }

        // SAFETY: the descriptor stays open while `send` is alive.
        let flags = unsafe { libc::fcntl(send.hooks().socket.as_raw_fd(), libc::F_GETFL) };
        assert!(flags >= 0, "F_GETFL should succeed");
        assert_eq!(flags & libc::O_NONBLOCK, 0, "send descriptor should stay blocking");

        let mut buff = send
            .get_send_buff(Duration::ZERO)
            .expect("get should succeed")
            .expect("frame should be available");
        buff.data_mut()[..4].copy_from_slice(b"ping");
        buff.set_packet_size(4);
        send.release_send_buff(buff).expect("send should succeed");

        device
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout should apply");
        let mut scratch = [0u8; 16];
        let (len, host_addr) = device.recv_from(&mut scratch).expect("device should receive");
        assert_eq!(&scratch[..len], b"ping");

        device.send_to(b"pong", host_addr).expect("device should reply");
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let buff = loop {
            if let Some(buff) = recv.get_recv_buff(Duration::ZERO).expect("poll should succeed") {
                break buff;
            }
            assert!(std::time::Instant::now() < deadline, "reply should arrive");
            std::thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(buff.packet(), b"pong");
        recv.release_recv_buff(buff);
    }

    #[test]
    fn test_links_support_out_of_order_release() {
        let device = device_socket();
        let (send, recv) = UdpLink::connect(
            device.local_addr().expect("device addr should resolve"),
            &small_params(),
        )
        .expect("link should connect");
        assert!(send.supports_send_buff_out_of_order());
        assert!(recv.supports_recv_buff_out_of_order());
        assert_eq!(recv.num_recv_frames(), 4);
        assert_eq!(send.send_frame_size(), 1024);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let device = device_socket();
        let params = LinkParams {
            recv_frame_size: 0,
            ..small_params()
        };
        let result = UdpLink::connect(
            device.local_addr().expect("device addr should resolve"),
            &params,
        );
        assert!(matches!(result, Err(TransportError::InvalidParams(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_socket_buffer_sizes_apply() {
        let device = device_socket();
        let params = LinkParams {
            recv_buff_size: Some(256 * 1024),
            send_buff_size: Some(128 * 1024),
            ..small_params()
        };
        UdpLink::connect(
            device.local_addr().expect("device addr should resolve"),
            &params,
        )
        .expect("link with socket buffer sizes should connect");
    }
}
