//! CHDR packet format.
//!
//! Every CHDR packet starts with one 64-bit header word:
//!
//! ```text
//! 63      58 57  55 54     48 47         32 31         16 15          0
//! ┌─────────┬──────┬─────────┬─────────────┬─────────────┬─────────────┐
//! │ flags   │ type │ num_mdata│ seq_num     │ length      │ dst_epid    │
//! └─────────┴──────┴─────────┴─────────────┴─────────────┴─────────────┘
//! ```
//!
//! followed by an optional timestamp, `num_mdata` metadata words and the
//! payload. The word width (64 to 512 bits) and byte order are properties
//! of the link and are captured by [`ChdrFormat`].
//!
//! - [`ChdrHeader`] packs and unpacks the header word.
//! - [`ChdrPacket`] is a view over a buffer holding one packet.
//! - [`payload`] holds the typed control, stream-status, stream-command
//!   and management payloads.

pub mod error;
pub mod format;
pub mod header;
pub mod packet;
pub mod payload;

pub use error::{PacketError, Result};
pub use format::{ChdrFormat, ChdrWidth, Endianness};
pub use header::{ChdrHeader, PacketType};
pub use packet::ChdrPacket;
pub use payload::{
    ChdrPayload, CtrlOpCode, CtrlPayload, CtrlStatus, MgmtHop, MgmtOp, MgmtOpCode, MgmtPayload,
    StrcOpCode, StrcPayload, StrsPayload, StrsStatus,
};
