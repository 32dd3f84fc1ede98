//! Control plane over CHDR links.
//!
//! A [`CtrlEndpoint`] owns one send/recv link pair towards a remote
//! endpoint. A background thread receives control packets and routes each
//! one, by destination port, to a [`CtrlportEndpoint`]. Each ctrlport
//! endpoint implements [`RegisterIface`] for the block that owns the port:
//! register writes and reads, flow-controlled against the device's command
//! buffer and matched with the device's acknowledgments.

pub mod ctrlport;
pub mod endpoint;
pub mod error;
pub mod regs;

pub use ctrlport::{AsyncMsgHandler, AsyncMsgValidator, CtrlportEndpoint, CtrlportPolicy, SendFn};
pub use endpoint::{CtrlEndpoint, CtrlEndpointConfig};
pub use error::{CtrlError, Result};
pub use regs::RegisterIface;
