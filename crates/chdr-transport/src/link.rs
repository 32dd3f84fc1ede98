use std::time::Duration;

use crate::buffer::{FrameBuff, FramePool};
use crate::error::Result;

/// Public contract of the transmit direction of a link.
///
/// Upper layers hold `Box<dyn SendLink>` so they stay independent of the
/// physical backend.
pub trait SendLink: Send {
    /// Acquire a frame to fill.
    ///
    /// Returns `Ok(None)` when the backend has no room within `timeout`.
    /// Holding every frame of the pool is a caller bug and fails with
    /// [`TransportError::PoolExhausted`](crate::TransportError::PoolExhausted).
    fn get_send_buff(&mut self, timeout: Duration) -> Result<Option<FrameBuff>>;

    /// Commit `packet_size` bytes of the frame to the wire and return the
    /// frame to the pool. A frame with `packet_size == 0` is returned
    /// without being sent.
    fn release_send_buff(&mut self, buff: FrameBuff) -> Result<()>;

    /// Number of frames in the send pool.
    fn num_send_frames(&self) -> usize;

    /// Size of every send frame in bytes.
    fn send_frame_size(&self) -> usize;

    /// Whether frames may be released in a different order than acquired.
    fn supports_send_buff_out_of_order(&self) -> bool;
}

/// Public contract of the receive direction of a link.
pub trait RecvLink: Send {
    /// Acquire a frame filled with one received packet.
    ///
    /// Returns `Ok(None)` on timeout. A zero `timeout` polls. Holding every
    /// frame of the pool fails with
    /// [`TransportError::PoolExhausted`](crate::TransportError::PoolExhausted).
    fn get_recv_buff(&mut self, timeout: Duration) -> Result<Option<FrameBuff>>;

    /// Return a received frame to the pool.
    fn release_recv_buff(&mut self, buff: FrameBuff);

    /// Number of frames in the receive pool.
    fn num_recv_frames(&self) -> usize;

    /// Size of every receive frame in bytes.
    fn recv_frame_size(&self) -> usize;

    /// Whether frames may be released in a different order than acquired.
    fn supports_recv_buff_out_of_order(&self) -> bool;
}

impl<L: SendLink + ?Sized> SendLink for Box<L> {
    fn get_send_buff(&mut self, timeout: Duration) -> Result<Option<FrameBuff>> {
        (**self).get_send_buff(timeout)
    }

    fn release_send_buff(&mut self, buff: FrameBuff) -> Result<()> {
        (**self).release_send_buff(buff)
    }

    fn num_send_frames(&self) -> usize {
        (**self).num_send_frames()
    }

    fn send_frame_size(&self) -> usize {
        (**self).send_frame_size()
    }

    fn supports_send_buff_out_of_order(&self) -> bool {
        (**self).supports_send_buff_out_of_order()
    }
}

impl<L: RecvLink + ?Sized> RecvLink for Box<L> {
    fn get_recv_buff(&mut self, timeout: Duration) -> Result<Option<FrameBuff>> {
        (**self).get_recv_buff(timeout)
    }

    fn release_recv_buff(&mut self, buff: FrameBuff) {
        (**self).release_recv_buff(buff)
    }

    fn num_recv_frames(&self) -> usize {
        (**self).num_recv_frames()
    }

    fn recv_frame_size(&self) -> usize {
        (**self).recv_frame_size()
    }

    fn supports_recv_buff_out_of_order(&self) -> bool {
        (**self).supports_recv_buff_out_of_order()
    }
}

/// Backend-specific behavior of a send link.
pub trait SendHooks: Send {
    /// Prepare a frame taken from the pool. Returning `false` means no
    /// frame could be prepared within `timeout`.
    fn get_send_buff_derived(&mut self, _buff: &mut FrameBuff, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }

    /// Put `buff.packet()` on the wire.
    fn release_send_buff_derived(&mut self, buff: &mut FrameBuff) -> Result<()>;

    /// Whether the backend tolerates out-of-order release.
    fn supports_out_of_order(&self) -> bool;
}

/// Backend-specific behavior of a receive link.
pub trait RecvHooks: Send {
    /// Fill `buff.data_mut()` with one packet. Returns the number of bytes
    /// received; `0` means nothing arrived within `timeout`.
    fn get_recv_buff_derived(&mut self, buff: &mut FrameBuff, timeout: Duration) -> Result<usize>;

    /// Hand the frame back to the backend before it returns to the pool.
    fn release_recv_buff_derived(&mut self, _buff: &mut FrameBuff) {}

    /// Whether the backend tolerates out-of-order release.
    fn supports_out_of_order(&self) -> bool;
}

/// Send direction of a link: a frame pool plus backend hooks.
pub struct SendLinkBase<H> {
    pool: FramePool,
    hooks: H,
}

impl<H: SendHooks> SendLinkBase<H> {
    /// Create a send link with `num_frames` frames of `frame_size` bytes.
    pub fn new(num_frames: usize, frame_size: usize, hooks: H) -> Self {
        Self {
            pool: FramePool::new(num_frames, frame_size),
            hooks,
        }
    }

    /// The backend hooks.
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Mutable access to the backend hooks.
    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    /// Frames currently held by callers.
    pub fn frames_in_flight(&self) -> usize {
        self.pool.in_flight()
    }
}

impl<H: SendHooks> SendLink for SendLinkBase<H> {
    fn get_send_buff(&mut self, timeout: Duration) -> Result<Option<FrameBuff>> {
        let mut buff = self.pool.acquire()?;
        match self.hooks.get_send_buff_derived(&mut buff, timeout) {
            Ok(true) => Ok(Some(buff)),
            Ok(false) => {
                self.pool.release(buff);
                Ok(None)
            }
            Err(err) => {
                self.pool.release(buff);
                Err(err)
            }
        }
    }

    fn release_send_buff(&mut self, mut buff: FrameBuff) -> Result<()> {
        let result = if buff.packet_size() > 0 {
            self.hooks.release_send_buff_derived(&mut buff)
        } else {
            Ok(())
        };
        self.pool.release(buff);
        result
    }

    fn num_send_frames(&self) -> usize {
        self.pool.capacity()
    }

    fn send_frame_size(&self) -> usize {
        self.pool.frame_size()
    }

    fn supports_send_buff_out_of_order(&self) -> bool {
        self.hooks.supports_out_of_order()
    }
}

/// Receive direction of a link: a frame pool plus backend hooks.
pub struct RecvLinkBase<H> {
    pool: FramePool,
    hooks: H,
}

impl<H: RecvHooks> RecvLinkBase<H> {
    /// Create a receive link with `num_frames` frames of `frame_size` bytes.
    pub fn new(num_frames: usize, frame_size: usize, hooks: H) -> Self {
        Self {
            pool: FramePool::new(num_frames, frame_size),
            hooks,
        }
    }

    /// The backend hooks.
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Mutable access to the backend hooks.
    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    /// Frames currently held by callers.
    pub fn frames_in_flight(&self) -> usize {
        self.pool.in_flight()
    }
}

impl<H: RecvHooks> RecvLink for RecvLinkBase<H> {
    fn get_recv_buff(&mut self, timeout: Duration) -> Result<Option<FrameBuff>> {
        let mut buff = self.pool.acquire()?;
        match self.hooks.get_recv_buff_derived(&mut buff, timeout) {
            Ok(0) => {
                self.pool.release(buff);
                Ok(None)
            }
            Ok(len) => {
                buff.set_packet_size(len);
                Ok(Some(buff))
            }
            Err(err) => {
                self.pool.release(buff);
                Err(err)
            }
        }
    }

    fn release_recv_buff(&mut self, mut buff: FrameBuff) {
        self.hooks.release_recv_buff_derived(&mut buff);
        self.pool.release(buff);
    }

    fn num_recv_frames(&self) -> usize {
        self.pool.capacity()
    }

    fn recv_frame_size(&self) -> usize {
        self.pool.frame_size()
    }

    fn supports_recv_buff_out_of_order(&self) -> bool {
        self.hooks.supports_out_of_order()
    }
}
