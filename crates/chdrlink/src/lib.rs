//! CHDR transport core.
//!
//! Re-exports the layers of the stack and adds a JSON configuration
//! model that builds them:
//!
//! | Layer | Crate |
//! |---|---|
//! | Frame pools and links | [`transport`] |
//! | Header and payload codecs | [`packet`] |
//! | Multi-channel alignment | [`stream`] |
//! | Control endpoints and register access | [`ctrl`] |
//!
//! ```no_run
//! use chdrlink::config::ChdrLinkConfig;
//! use chdrlink::ctrl::RegisterIface;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ChdrLinkConfig::from_path("device.json")?;
//! let ctrl = config.open_udp_ctrl_endpoint()?;
//! let block = ctrl.get_ctrlport_ep(2, 64, 1)?;
//! let version = block.peek32(0x0, None)?;
//! # let _ = version;
//! # Ok(())
//! # }
//! ```

pub mod config;
#[cfg(feature = "logging")]
pub mod logging;

pub use chdr_ctrl as ctrl;
pub use chdr_packet as packet;
pub use chdr_stream as stream;
pub use chdr_transport as transport;

pub use chdr_ctrl::{CtrlEndpoint, CtrlError, CtrlportEndpoint, RegisterIface};
pub use chdr_packet::{ChdrFormat, ChdrHeader, ChdrPacket, PacketError, PacketType};
pub use chdr_stream::{ChannelAligner, ChdrRxDataXport, StreamError};
pub use chdr_transport::{FrameBuff, LinkParams, RecvLink, SendLink, TransportError};
pub use config::{ChdrLinkConfig, ConfigError, LogFormat, LogLevel, LogSection};
