use crate::error::{Result, TransportError};

/// Default number of frames per direction.
pub const DEFAULT_NUM_FRAMES: usize = 32;

/// Default frame size: a standard 8000-byte jumbo-safe CHDR frame.
pub const DEFAULT_FRAME_SIZE: usize = 8000;

/// Sizing parameters for both directions of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkParams {
    /// Number of frames in the receive pool.
    pub num_recv_frames: usize,
    /// Size of every receive frame in bytes.
    pub recv_frame_size: usize,
    /// Number of frames in the send pool.
    pub num_send_frames: usize,
    /// Size of every send frame in bytes.
    pub send_frame_size: usize,
    /// Requested kernel receive buffer size; `None` leaves the OS default.
    pub recv_buff_size: Option<usize>,
    /// Requested kernel send buffer size; `None` leaves the OS default.
    pub send_buff_size: Option<usize>,
}

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            num_recv_frames: DEFAULT_NUM_FRAMES,
            recv_frame_size: DEFAULT_FRAME_SIZE,
            num_send_frames: DEFAULT_NUM_FRAMES,
            send_frame_size: DEFAULT_FRAME_SIZE,
            recv_buff_size: None,
            send_buff_size: None,
        }
    }
}

impl LinkParams {
    /// Check that every pool has at least one non-empty frame.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("num_recv_frames", self.num_recv_frames),
            ("recv_frame_size", self.recv_frame_size),
            ("num_send_frames", self.num_send_frames),
            ("send_frame_size", self.send_frame_size),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(TransportError::InvalidParams(format!("{name} must be non-zero")));
            }
        }
        if self.recv_buff_size == Some(0) || self.send_buff_size == Some(0) {
            return Err(TransportError::InvalidParams(
                "socket buffer sizes must be non-zero when set".to_string(),
            ));
        }
        Ok(())
    }
}
