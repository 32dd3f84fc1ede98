use bytes::BytesMut;
use tracing::{error, warn};

use crate::error::{Result, TransportError};

/// A fixed-capacity byte region handed out by a [`FramePool`].
///
/// `packet_size` is the number of valid bytes. A frame leaves its pool
/// with `packet_size == 0`; the receive path sets it to the number of bytes
/// received and the send path sets it to the number of bytes to commit.
///
/// Frames are move-only. A frame that is dropped while still in flight is
/// lost to its pool and reported through `tracing`.
pub struct FrameBuff {
    data: BytesMut,
    packet_size: usize,
    in_flight: bool,
}

impl FrameBuff {
    fn new(frame_size: usize) -> Self {
        Self {
            data: BytesMut::zeroed(frame_size),
            packet_size: 0,
            in_flight: false,
        }
    }

    /// The whole backing region, regardless of `packet_size`.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the whole backing region.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The valid bytes of the frame (`data()[..packet_size]`).
    pub fn packet(&self) -> &[u8] {
        &self.data[..self.packet_size]
    }

    /// Number of valid bytes.
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Set the number of valid bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds the frame capacity.
    pub fn set_packet_size(&mut self, size: usize) {
        assert!(
            size <= self.data.len(),
            "packet size {size} exceeds frame capacity {}",
            self.data.len()
        );
        self.packet_size = size;
    }

    /// Capacity of the backing region in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl AsRef<[u8]> for FrameBuff {
    fn as_ref(&self) -> &[u8] {
        self.packet()
    }
}

impl std::fmt::Debug for FrameBuff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuff")
            .field("capacity", &self.data.len())
            .field("packet_size", &self.packet_size)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl Drop for FrameBuff {
    fn drop(&mut self) {
        if self.in_flight {
            error!(
                capacity = self.data.len(),
                packet_size = self.packet_size,
                "frame dropped while in flight; it will not return to its pool"
            );
        }
    }
}

/// Fixed-size set of frames owned by one link direction.
///
/// `available() + in_flight() == capacity()` holds at all times.
#[derive(Debug)]
pub struct FramePool {
    free: Vec<FrameBuff>,
    capacity: usize,
    frame_size: usize,
}

impl FramePool {
    /// Preallocate `num_frames` frames of `frame_size` bytes each.
    pub fn new(num_frames: usize, frame_size: usize) -> Self {
        let free = (0..num_frames).map(|_| FrameBuff::new(frame_size)).collect();
        Self {
            free,
            capacity: num_frames,
            frame_size,
        }
    }

    /// Take a frame out of the pool.
    ///
    /// Fails only when every frame is in flight; never blocks.
    pub fn acquire(&mut self) -> Result<FrameBuff> {
        let mut buff = self.free.pop().ok_or(TransportError::PoolExhausted {
            capacity: self.capacity,
        })?;
        buff.packet_size = 0;
        buff.in_flight = true;
        Ok(buff)
    }

    /// Return a frame to the pool.
    pub fn release(&mut self, mut buff: FrameBuff) {
        buff.packet_size = 0;
        buff.in_flight = false;
        if self.free.len() >= self.capacity || buff.capacity() != self.frame_size {
            warn!(
                frame_size = buff.capacity(),
                pool_frame_size = self.frame_size,
                "frame released to a pool that does not own it; discarding"
            );
            return;
        }
        self.free.push(buff);
    }

    /// Total number of frames owned by the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames currently waiting in the pool.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Frames currently held by callers.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.free.len()
    }

    /// Size in bytes of every frame in the pool.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }
}
