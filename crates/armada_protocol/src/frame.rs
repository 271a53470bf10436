//! # Wire frame codec
//!
//! One frame on the wire is:
//!
//! ```text
//! int32 channelId | varint headerLen | header bytes | varint bodyLen | body bytes
//! ```
//!
//! The channel id multiplexes logical traffic classes over one physical
//! connection (see [`channel_ids`]). The header is itself a structured
//! buffer, typically carrying a correlation id and small metadata; the body
//! carries the application payload.
//!
//! Decoding is resumable: [`FrameDecoder`] buffers partial input and only
//! consumes bytes once a complete frame is available, so a frame is never
//! partially delivered to a listener. A frame whose declared size exceeds
//! the configured ceiling is a protocol error; the owning channel must be
//! closed because the stream cannot re-synchronize.

use crate::buf::DataBuf;
use crate::error::ProtocolError;
use crate::varint;
use bytes::{Buf, BufMut, BytesMut};

/// Reserved wire channel ids multiplexed over one connection.
pub mod channel_ids {
    /// Raw packets: handshake and low-level control.
    pub const RAW: i32 = 0;
    /// RPC invocations and their responses.
    pub const RPC: i32 = 1;
    /// Query/response traffic outside the RPC framework.
    pub const QUERY: i32 = 2;
    /// Chunked transfer of large payloads.
    pub const TRANSFER: i32 = 3;
    /// Channel messages routed by the messaging bus.
    pub const MESSAGE: i32 = 4;
}

/// Default ceiling for a single decoded frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// One discrete message on a connection.
#[derive(Debug, Clone)]
pub struct Frame {
    pub channel_id: i32,
    pub header: DataBuf,
    pub body: DataBuf,
}

impl Frame {
    pub fn new(channel_id: i32, header: DataBuf, body: DataBuf) -> Self {
        Self {
            channel_id,
            header,
            body,
        }
    }

    /// A frame with an empty header.
    pub fn bare(channel_id: i32, body: DataBuf) -> Self {
        Self::new(channel_id, DataBuf::new(), body)
    }

    /// Encodes the frame; neither payload buffer is consumed.
    pub fn encode(&self) -> BytesMut {
        let header = self.header.readable_slice();
        let body = self.body.readable_slice();
        let mut out = BytesMut::with_capacity(self.encoded_len());
        out.put_i32_le(self.channel_id);
        varint::write_var_u64(&mut out, header.len() as u64);
        out.extend_from_slice(header);
        varint::write_var_u64(&mut out, body.len() as u64);
        out.extend_from_slice(body);
        out
    }

    /// Exact number of bytes [`Frame::encode`] will produce.
    pub fn encoded_len(&self) -> usize {
        let header = self.header.readable_bytes();
        let body = self.body.readable_bytes();
        4 + varint::var_len(header as u64) + header + varint::var_len(body as u64) + body
    }
}

/// Resumable stream decoder producing complete frames.
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Appends freshly received bytes to the internal buffer.
    pub fn extend(&mut self, input: &[u8]) {
        self.buffer.extend_from_slice(input);
    }

    /// Bytes buffered but not yet consumed by a complete frame.
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Attempts to decode the next complete frame.
    ///
    /// Returns `Ok(None)` when the buffered input ends mid-frame; nothing is
    /// consumed in that case. Size-ceiling violations are reported as soon
    /// as a declared length is known, before the payload has arrived.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let limit = self.max_frame_size as u64;
        let buf = &self.buffer[..];
        if buf.len() < 4 {
            return Ok(None);
        }
        let channel_id = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);

        let mut offset = 4usize;
        let Some((header_len, n)) = varint::peek_var_u64(&buf[offset..])? else {
            return Ok(None);
        };
        if header_len > limit {
            return Err(ProtocolError::FrameTooLarge {
                size: header_len as usize,
                limit: self.max_frame_size,
            });
        }
        offset += n;
        let header_len = header_len as usize;
        if buf.len() < offset + header_len {
            return Ok(None);
        }

        let body_offset = offset + header_len;
        let Some((body_len, m)) = varint::peek_var_u64(&buf[body_offset..])? else {
            return Ok(None);
        };
        if body_len > limit || header_len as u64 + body_len > limit {
            return Err(ProtocolError::FrameTooLarge {
                size: (header_len as u64 + body_len) as usize,
                limit: self.max_frame_size,
            });
        }
        let body_len = body_len as usize;
        let total = body_offset + m + body_len;
        if buf.len() < total {
            return Ok(None);
        }

        let mut frame_bytes = self.buffer.split_to(total);
        frame_bytes.advance(offset);
        let header = frame_bytes.split_to(header_len);
        frame_bytes.advance(m);

        Ok(Some(Frame {
            channel_id,
            header: DataBuf::from_bytes(header),
            body: DataBuf::from_bytes(frame_bytes),
        }))
    }

    /// Drains every complete frame currently buffered.
    pub fn drain_frames(&mut self) -> Result<Vec<Frame>, ProtocolError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame(channel_id: i32, marker: &str) -> Frame {
        let mut header = DataBuf::new();
        header.write_unique_id(&uuid::Uuid::new_v4()).unwrap();
        let mut body = DataBuf::new();
        body.write_string(marker).unwrap();
        body.write_u32(marker.len() as u32).unwrap();
        Frame::new(channel_id, header, body)
    }

    #[test]
    fn encode_then_decode_preserves_order_and_content() {
        let frames: Vec<Frame> = (0..5)
            .map(|i| sample_frame(i, &format!("frame-{i}")))
            .collect();

        let mut decoder = FrameDecoder::default();
        for frame in &frames {
            decoder.extend(&frame.encode());
        }

        let decoded = decoder.drain_frames().unwrap();
        assert_eq!(decoded.len(), frames.len());
        for (i, mut frame) in decoded.into_iter().enumerate() {
            assert_eq!(frame.channel_id, i as i32);
            assert_eq!(frame.body.read_string().unwrap(), format!("frame-{i}"));
        }
        assert_eq!(decoder.buffered_bytes(), 0);
    }

    #[test]
    fn decode_resumes_across_partial_chunks() {
        let frames: Vec<Frame> = (0..3)
            .map(|i| sample_frame(channel_ids::MESSAGE, &format!("chunked-{i}")))
            .collect();
        let mut wire = BytesMut::new();
        for frame in &frames {
            wire.extend_from_slice(&frame.encode());
        }

        // Feed one byte at a time, as a slow peer would.
        let mut decoder = FrameDecoder::default();
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            decoder.extend(std::slice::from_ref(byte));
            while let Some(frame) = decoder.next_frame().unwrap() {
                decoded.push(frame);
            }
        }

        assert_eq!(decoded.len(), 3);
        for (i, frame) in decoded.iter_mut().enumerate() {
            assert_eq!(frame.body.read_string().unwrap(), format!("chunked-{i}"));
        }
    }

    #[test]
    fn incomplete_frame_consumes_nothing() {
        let frame = sample_frame(channel_ids::RPC, "held-back");
        let encoded = frame.encode();

        let mut decoder = FrameDecoder::default();
        decoder.extend(&encoded[..encoded.len() - 1]);
        assert!(decoder.next_frame().unwrap().is_none());
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered_bytes(), encoded.len() - 1);

        decoder.extend(&encoded[encoded.len() - 1..]);
        let mut decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded.body.read_string().unwrap(), "held-back");
    }

    #[test]
    fn oversized_declared_length_fails_before_payload_arrives() {
        let mut wire = BytesMut::new();
        wire.put_i32_le(channel_ids::RAW);
        varint::write_var_u64(&mut wire, 10_000_000);

        let mut decoder = FrameDecoder::new(1024);
        decoder.extend(&wire);
        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn oversized_body_is_rejected() {
        let mut wire = BytesMut::new();
        wire.put_i32_le(channel_ids::RAW);
        varint::write_var_u64(&mut wire, 0);
        varint::write_var_u64(&mut wire, 2048);

        let mut decoder = FrameDecoder::new(1024);
        decoder.extend(&wire);
        let err = decoder.next_frame().unwrap_err();
        assert!(err.poisons_stream());
    }

    #[test]
    fn empty_header_and_body_round_trip() {
        let frame = Frame::bare(-7, DataBuf::new());
        let mut decoder = FrameDecoder::default();
        decoder.extend(&frame.encode());
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded.channel_id, -7);
        assert_eq!(decoded.header.readable_bytes(), 0);
        assert_eq!(decoded.body.readable_bytes(), 0);
    }

    #[test]
    fn encoded_len_matches_encode() {
        let frame = sample_frame(channel_ids::TRANSFER, "sized");
        assert_eq!(frame.encode().len(), frame.encoded_len());
    }
}
