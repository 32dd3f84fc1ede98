use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Result, StreamError};
use crate::xport::{RxDataXport, RxPacket};

/// Reference re-elections allowed in one alignment call.
pub const DEFAULT_FAILURE_THRESHOLD: usize = 1000;

/// Configuration for [`ChannelAligner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignConfig {
    /// Treat sequence gaps as normal packets instead of reporting them.
    pub ignore_seq_errors: bool,
    /// Reference re-elections allowed before giving up.
    pub failure_threshold: usize,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            ignore_seq_errors: false,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

/// Groups one packet per channel by embedded timestamp.
///
/// Packets already pulled from a transport but not yet handed out stay
/// with the aligner when a call ends without success, and are examined
/// again first by the next call.
pub struct ChannelAligner<X: RxDataXport> {
    xports: Vec<X>,
    held: Vec<Option<RxPacket>>,
    config: AlignConfig,
}

impl<X: RxDataXport> ChannelAligner<X> {
    /// Create an aligner over one transport per channel.
    pub fn new(xports: Vec<X>, config: AlignConfig) -> Self {
        let held = xports.iter().map(|_| None).collect();
        Self {
            xports,
            held,
            config,
        }
    }

    /// Number of channels.
    pub fn num_channels(&self) -> usize {
        self.xports.len()
    }

    /// Active configuration.
    pub fn config(&self) -> &AlignConfig {
        &self.config
    }

    /// The transport of one channel.
    pub fn xport(&self, channel: usize) -> &X {
        &self.xports[channel]
    }

    /// Number of packets held over from earlier calls.
    pub fn num_held(&self) -> usize {
        self.held.iter().filter(|h| h.is_some()).count()
    }

    /// Pull packets until every channel holds one with the same timestamp.
    ///
    /// On success returns one packet per channel, indexed by channel.
    /// `Ok(None)` means a channel produced nothing within `timeout`; the
    /// packets gathered so far are kept for the next call. A packet that
    /// reveals a sequence gap is kept as well, so the call after a
    /// [`StreamError::SequenceError`] resumes with it.
    pub fn get_aligned_buffs(&mut self, timeout: Duration) -> Result<Option<Vec<RxPacket>>> {
        let num_channels = self.xports.len();
        let mut pending = vec![true; num_channels];
        let mut last_tsf: Vec<Option<u64>> = vec![None; num_channels];
        let mut reference: Option<u64> = None;
        let mut iterations = 0usize;

        while let Some(chan) = pending.iter().position(|p| *p) {
            let packet = match self.held[chan].take() {
                Some(packet) => packet,
                None => match self.xports[chan].get_recv_buff(timeout) {
                    Ok(Some(packet)) => {
                        if let Some(gap) = packet.seq_error {
                            if !self.config.ignore_seq_errors {
                                self.held[chan] = Some(packet);
                                return Err(StreamError::SequenceError {
                                    channel: chan,
                                    expected: gap.expected,
                                    received: gap.received,
                                });
                            }
                        }
                        packet
                    }
                    Ok(None) => return Ok(None),
                    Err(StreamError::Packet(source)) => {
                        return Err(StreamError::BadPacket {
                            channel: chan,
                            source,
                        })
                    }
                    Err(err) => return Err(err),
                },
            };

            let Some(tsf) = packet.info.tsf else {
                self.held[chan] = Some(packet);
                pending[chan] = false;
                continue;
            };

            if last_tsf[chan].replace(tsf).is_some_and(|last| tsf < last) {
                debug!(channel = chan, tsf, "timestamp went backwards, resetting reference");
                reference = None;
            }

            match reference {
                Some(reference_tsf) if tsf == reference_tsf => {
                    self.held[chan] = Some(packet);
                    pending[chan] = false;
                }
                Some(reference_tsf) if tsf < reference_tsf => {
                    self.xports[chan].release_recv_buff(packet.buff);
                }
                _ => {
                    let slots = self.held.iter_mut().zip(self.xports.iter_mut());
                    for ((held, xport), pending) in slots.zip(pending.iter_mut()) {
                        if *pending || !held.as_ref().is_some_and(|p| p.info.tsf.is_some()) {
                            continue;
                        }
                        if let Some(stale) = held.take() {
                            xport.release_recv_buff(stale.buff);
                            *pending = true;
                        }
                    }
                    reference = Some(tsf);
                    self.held[chan] = Some(packet);
                    pending[chan] = false;

                    iterations += 1;
                    if iterations > self.config.failure_threshold {
                        warn!(iterations, "channel timestamps did not converge");
                        return Err(StreamError::AlignmentFailure { iterations });
                    }
                }
            }
        }

        Ok(Some(self.held.iter_mut().filter_map(Option::take).collect()))
    }

    /// Return packets obtained from [`ChannelAligner::get_aligned_buffs`]
    /// to their links. The packet at index `i` belongs to channel `i`.
    ///
    /// # Panics
    ///
    /// Panics if `packets` does not hold exactly one packet per channel.
    pub fn release_aligned(&mut self, packets: Vec<RxPacket>) {
        assert_eq!(
            packets.len(),
            self.xports.len(),
            "release_aligned takes one packet per channel"
        );
        for (xport, packet) in self.xports.iter_mut().zip(packets) {
            xport.release_recv_buff(packet.buff);
        }
    }

    /// Release every packet held over from earlier calls.
    pub fn release_held(&mut self) {
        for (xport, held) in self.xports.iter_mut().zip(self.held.iter_mut()) {
            if let Some(packet) = held.take() {
                xport.release_recv_buff(packet.buff);
            }
        }
    }
}

impl<X: RxDataXport> Drop for ChannelAligner<X> {
    fn drop(&mut self) {
        self.release_held();
    }
}
