use crate::error::{PacketError, Result};
use crate::format::{check_len, ChdrFormat};
use crate::header::{ChdrHeader, PacketType};
use crate::payload::ChdrPayload;

/// Byte offset of the timestamp on every width.
const TIMESTAMP_OFFSET: usize = 8;

/// A view over a buffer holding one CHDR packet.
///
/// The view owns nothing but the buffer handle `B` it was given (a slice, a
/// `Vec`, a frame buffer). The decoded header is cached; every region
/// offset is derived from it on access.
#[derive(Debug)]
pub struct ChdrPacket<B> {
    format: ChdrFormat,
    header: ChdrHeader,
    buf: B,
}

impl<B: AsRef<[u8]>> ChdrPacket<B> {
    /// Bind to a buffer that already holds a packet and decode its header.
    ///
    /// Fails when the buffer is shorter than the header region, when the
    /// packet type is reserved, or when the `length` field is larger than
    /// the buffer or smaller than the header and metadata it declares.
    pub fn parse(format: ChdrFormat, buf: B) -> Result<Self> {
        let header = format.read_header(buf.as_ref())?;
        let packet = Self {
            format,
            header,
            buf,
        };
        packet.validate()?;
        Ok(packet)
    }

    /// Re-read the header after the underlying bytes changed.
    pub fn refresh(&mut self) -> Result<()> {
        self.header = self.format.read_header(self.buf.as_ref())?;
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        let len = self.buf.as_ref().len();
        check_len(len, self.format.metadata_byte_offset(&self.header))?;
        let length = usize::from(self.header.length);
        if length > len {
            return Err(PacketError::LengthMismatch {
                length,
                reason: "exceeds buffer",
            });
        }
        if length < self.format.payload_byte_offset(&self.header) {
            return Err(PacketError::LengthMismatch {
                length,
                reason: "shorter than header and metadata",
            });
        }
        Ok(())
    }

    /// Link format the packet was bound with.
    pub fn format(&self) -> ChdrFormat {
        self.format
    }

    /// The decoded header.
    pub fn header(&self) -> &ChdrHeader {
        &self.header
    }

    /// Byte length of the header region (header word plus timestamp word).
    pub fn header_bytes(&self) -> usize {
        self.format.metadata_byte_offset(&self.header)
    }

    /// The timestamp, present on every `DataWithTs` packet.
    ///
    /// On 64-bit links it is the word after the header; on wider links it
    /// is the upper half of the header word. Both sit at byte offset 8.
    pub fn timestamp(&self) -> Option<u64> {
        if self.header.pkt_type != PacketType::DataWithTs {
            return None;
        }
        let bytes = self.buf.as_ref().get(TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8)?;
        Some(self.format.endianness.read_u64(bytes))
    }

    /// Metadata length in bytes.
    pub fn metadata_bytes(&self) -> usize {
        usize::from(self.header.num_mdata) * self.format.word_bytes()
    }

    /// The metadata region.
    pub fn metadata(&self) -> &[u8] {
        let (start, end) = self.metadata_range();
        &self.buf.as_ref()[start..end]
    }

    /// Payload length in bytes, as declared by `length`.
    pub fn payload_bytes(&self) -> usize {
        self.format.payload_byte_length(&self.header)
    }

    /// The payload region.
    pub fn payload(&self) -> &[u8] {
        let (start, end) = self.payload_range();
        &self.buf.as_ref()[start..end]
    }

    /// Total packet length in bytes.
    pub fn packet_bytes(&self) -> usize {
        usize::from(self.header.length)
    }

    /// Decode the payload as `P`.
    pub fn payload_as<P: ChdrPayload>(&self) -> Result<P> {
        if self.header.pkt_type != P::PACKET_TYPE {
            return Err(PacketError::WrongPacketType {
                expected: P::PACKET_TYPE,
                found: self.header.pkt_type,
            });
        }
        P::deserialize(self.payload(), &self.format)
    }

    /// Give back the buffer.
    pub fn into_inner(self) -> B {
        self.buf
    }

    fn clamp(&self, start: usize, end: usize) -> (usize, usize) {
        let len = self.buf.as_ref().len();
        let end = end.min(len);
        (start.min(end), end)
    }

    fn metadata_range(&self) -> (usize, usize) {
        self.clamp(
            self.format.metadata_byte_offset(&self.header),
            self.format.payload_byte_offset(&self.header),
        )
    }

    fn payload_range(&self) -> (usize, usize) {
        self.clamp(
            self.format.payload_byte_offset(&self.header),
            usize::from(self.header.length),
        )
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> ChdrPacket<B> {
    /// Frame a fresh buffer: write `header` (and `timestamp` on
    /// `DataWithTs` packets) and bind to it.
    ///
    /// A `DataWithTs` header requires a timestamp and other types reject
    /// one. The caller is expected to write the payload and then call
    /// [`ChdrPacket::update_payload_size`].
    pub fn init(format: ChdrFormat, mut buf: B, header: ChdrHeader, timestamp: Option<u64>) -> Result<Self> {
        let with_ts = header.pkt_type == PacketType::DataWithTs;
        match (with_ts, timestamp) {
            (true, None) => {
                return Err(PacketError::InvalidPayload(
                    "DataWithTs packet requires a timestamp".to_string(),
                ))
            }
            (false, Some(_)) => {
                return Err(PacketError::InvalidPayload(format!(
                    "{:?} packet cannot carry a timestamp",
                    header.pkt_type
                )))
            }
            _ => {}
        }

        let needed = format.payload_byte_offset(&header);
        check_len(buf.as_ref().len(), needed.max(8))?;

        let dst = buf.as_mut();
        format.write_header(dst, &header)?;
        if let Some(ts) = timestamp {
            format
                .endianness
                .write_u64(&mut dst[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8], ts);
        }
        Ok(Self {
            format,
            header,
            buf,
        })
    }

    /// Frame a fresh buffer around a typed payload.
    ///
    /// `header` supplies the sequence number and destination; the packet
    /// type, flags, metadata count and length are derived from `payload`.
    pub fn init_with_payload<P: ChdrPayload>(
        format: ChdrFormat,
        buf: B,
        mut header: ChdrHeader,
        payload: &P,
    ) -> Result<Self> {
        payload.populate_header(&mut header);
        let mut packet = Self::init(format, buf, header, None)?;
        let written = payload.serialize(packet.payload_capacity_mut(), &format)?;
        packet.update_payload_size(written)?;
        Ok(packet)
    }

    /// Rewrite `length` for a new payload size, keeping `num_mdata`.
    pub fn update_payload_size(&mut self, payload_bytes: usize) -> Result<()> {
        let mut header = self.header;
        self.format.set_length(&mut header, payload_bytes)?;
        let len = self.buf.as_ref().len();
        if usize::from(header.length) > len {
            return Err(PacketError::PayloadTooLarge {
                size: usize::from(header.length),
                max: len,
            });
        }
        self.set_header(header)
    }

    /// Replace the header and write it to the buffer.
    pub fn set_header(&mut self, header: ChdrHeader) -> Result<()> {
        self.format.write_header(self.buf.as_mut(), &header)?;
        self.header = header;
        Ok(())
    }

    /// Mutable metadata region.
    pub fn metadata_mut(&mut self) -> &mut [u8] {
        let (start, end) = self.metadata_range();
        &mut self.buf.as_mut()[start..end]
    }

    /// Mutable payload region, as declared by `length`.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let (start, end) = self.payload_range();
        &mut self.buf.as_mut()[start..end]
    }

    /// Everything from the payload offset to the end of the buffer.
    ///
    /// Write the payload here before [`ChdrPacket::update_payload_size`].
    pub fn payload_capacity_mut(&mut self) -> &mut [u8] {
        let start = self
            .format
            .payload_byte_offset(&self.header)
            .min(self.buf.as_ref().len());
        &mut self.buf.as_mut()[start..]
    }
}
