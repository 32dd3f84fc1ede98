//! Buffer-pool-backed link abstraction for CHDR transports.
//!
//! Every physical backend (UDP sockets, DMA engines, kernel-bypass NICs)
//! is exposed through the same pair of link types:
//! - [`SendLinkBase`] acquires a frame from its pool, lets the caller fill
//!   it, and commits it to the wire on release.
//! - [`RecvLinkBase`] acquires a frame, asks the backend to fill it, and
//!   returns the frame to its pool on release.
//!
//! Backends only implement the small [`SendHooks`] / [`RecvHooks`] traits.
//! This is the lowest layer of chdrlink. Everything else builds on top of
//! the [`FrameBuff`] type provided here.

pub mod buffer;
pub mod error;
pub mod link;
pub mod mock;
pub mod params;
pub mod udp;

pub use buffer::{FrameBuff, FramePool};
pub use error::{Result, TransportError};
pub use link::{RecvHooks, RecvLink, RecvLinkBase, SendHooks, SendLink, SendLinkBase};
pub use mock::{mock_recv_link, mock_send_link, MockRecvHandle, MockRecvLink, MockSendHandle, MockSendLink};
pub use params::LinkParams;
pub use udp::{UdpLink, UdpRecvLink, UdpSendLink};
