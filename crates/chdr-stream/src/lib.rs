//! Receive-side streaming over CHDR links.
//!
//! - [`ChdrRxDataXport`] turns raw frames from a [`RecvLink`] into data
//!   packets with decoded metadata and sequence tracking. With flow
//!   control attached it also answers stream commands and reports consumed
//!   packets back to the sender.
//! - [`ChannelAligner`] pulls one packet per channel from N transports and
//!   hands them out only once their timestamps agree.
//!
//! [`RecvLink`]: chdr_transport::RecvLink

pub mod align;
pub mod error;
pub mod flow;
pub mod xport;

pub use align::{AlignConfig, ChannelAligner, DEFAULT_FAILURE_THRESHOLD};
pub use error::{Result, StreamError};
pub use flow::{RxFlowCtrlConfig, RxFlowCtrlSender, RxFlowCtrlState, StreamBuffParams};
pub use xport::{ChdrRxDataXport, PacketInfo, RxDataXport, RxPacket, SeqGap};
