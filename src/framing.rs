//! Length-prefixed binary framing.
//!
//! Each frame is a variable-length length prefix followed by exactly that
//! many payload bytes:
//!
//! ```text
//! [varint length] [payload: length bytes]
//! ```
//!
//! The prefix stores the length little-endian in 7-bit groups. The high bit
//! of each prefix byte is set when another prefix byte follows:
//!
//! ```text
//! 0x7f          -> 127
//! 0x80 0x01     -> 128
//! 0xff 0xff 0x7f -> 2_097_151
//! ```
//!
//! [`BinaryFramer::parse`] splits a buffer into complete payloads and reports
//! how many bytes it consumed; a trailing partial frame stays in the buffer.
//! [`FrameDecoder`] wraps that for byte streams whose chunk boundaries do not
//! match frame boundaries.

use bytes::{Bytes, BytesMut};

use crate::constants::{MAX_LENGTH_PREFIX_BYTES, MAX_MESSAGE_SIZE};
use crate::protocol::ProtocolError;

/// Writes and parses length-prefixed frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryFramer {
    max_message_size: usize,
}

/// Result of [`BinaryFramer::parse`].
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedFrames<'a> {
    /// Complete payloads, in order, borrowed from the input.
    pub payloads: Vec<&'a [u8]>,
    /// Number of input bytes covered by `payloads` (prefixes included).
    pub consumed: usize,
}

impl BinaryFramer {
    /// Create a framer that rejects payloads longer than `max_message_size`.
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    /// Configured payload size limit.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Prefix `payload` with its length.
    pub fn write(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_LENGTH_PREFIX_BYTES + payload.len());
        self.write_into(payload, &mut out);
        out
    }

    /// Append a framed `payload` to `out`.
    pub fn write_into(&self, payload: &[u8], out: &mut Vec<u8>) {
        write_length_prefix(payload.len(), out);
        out.extend_from_slice(payload);
    }

    /// Split as many complete frames as possible off the front of `buffer`.
    ///
    /// A trailing partial frame (incomplete prefix or missing payload bytes)
    /// is not returned and not counted in `consumed`.
    ///
    /// # Errors
    ///
    /// Fails with [`ProtocolError::FrameTooLarge`] when the first frame
    /// declares a length above the limit, or [`ProtocolError::MalformedMessage`]
    /// when its prefix is longer than the format allows. Nothing is consumed
    /// in that case. A bad frame that follows good ones ends the batch: the
    /// good payloads are returned and the bad frame is left in place, so the
    /// next call reports it.
    pub fn parse<'a>(&self, buffer: &'a [u8]) -> Result<ParsedFrames<'a>, ProtocolError> {
        let mut payloads = Vec::new();
        let mut offset = 0;

        while offset < buffer.len() {
            let (length, prefix_len) = match read_length_prefix(&buffer[offset..], self.max_message_size) {
                Ok(Some(header)) => header,
                Ok(None) => break, // Incomplete prefix, wait for more data
                Err(e) if payloads.is_empty() => return Err(e),
                Err(e) => {
                    log::debug!("Stopping frame batch at offset {offset}: {e}");
                    break;
                }
            };

            let start = offset + prefix_len;
            let end = start + length;
            if end > buffer.len() {
                break; // Incomplete payload
            }

            payloads.push(&buffer[start..end]);
            offset = end;
        }

        Ok(ParsedFrames {
            payloads,
            consumed: offset,
        })
    }
}

impl Default for BinaryFramer {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl ParsedFrames<'_> {
    /// True if no complete frame was found.
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

/// Append the varint encoding of `length` to `out`.
fn write_length_prefix(mut length: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (length & 0x7f) as u8;
        length >>= 7;
        if length > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if length == 0 {
            break;
        }
    }
}

/// Read a length prefix from the start of `buf`.
///
/// Returns `Ok(None)` when the prefix is not complete yet, otherwise the
/// payload length and the number of prefix bytes.
fn read_length_prefix(buf: &[u8], max: usize) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut length: u64 = 0;

    for (i, &byte) in buf.iter().take(MAX_LENGTH_PREFIX_BYTES).enumerate() {
        length |= u64::from(byte & 0x7f) << (7 * i);

        if byte & 0x80 == 0 {
            if length > max as u64 {
                return Err(ProtocolError::FrameTooLarge { length, max });
            }
            // length <= max, so it fits in usize
            return Ok(Some((length as usize, i + 1)));
        }
    }

    if buf.len() >= MAX_LENGTH_PREFIX_BYTES {
        return Err(ProtocolError::MalformedMessage(format!(
            "length prefix longer than {MAX_LENGTH_PREFIX_BYTES} bytes"
        )));
    }

    Ok(None)
}

/// Incremental frame reassembly for byte streams.
///
/// Feed chunks via [`FrameDecoder::feed`]; every call returns the complete
/// frames accumulated so far, with their length prefixes intact, so the
/// result can be handed to anything that parses framed input (for example
/// [`crate::protocol::MessagePackHubProtocol::decode_all`]).
#[derive(Debug)]
pub struct FrameDecoder {
    framer: BinaryFramer,
    buf: BytesMut,
}

impl FrameDecoder {
    /// Create a decoder with an empty buffer.
    pub fn new(framer: BinaryFramer) -> Self {
        Self {
            framer,
            buf: BytesMut::new(),
        }
    }

    /// Buffer `bytes` and take every complete frame out of the buffer.
    ///
    /// Returns `None` when no complete frame is available yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the next frame's prefix is invalid or exceeds the
    /// size limit. The stream cannot be resynchronized after that.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Option<Bytes>, ProtocolError> {
        self.buf.extend_from_slice(bytes);

        let consumed = self.framer.parse(&self.buf)?.consumed;
        if consumed == 0 {
            return Ok(None);
        }

        Ok(Some(self.buf.split_to(consumed).freeze()))
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(BinaryFramer::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_encoding_boundaries() {
        let framer = BinaryFramer::default();
        assert_eq!(framer.write(&[]), vec![0x00]);
        assert_eq!(&framer.write(&[7u8; 127])[..1], &[0x7f]);
        assert_eq!(&framer.write(&[7u8; 128])[..2], &[0x80, 0x01]);
        assert_eq!(&framer.write(&vec![7u8; 16_384])[..3], &[0x80, 0x80, 0x01]);
    }

    #[test]
    fn test_write_then_parse_single_frame() {
        let framer = BinaryFramer::default();
        let framed = framer.write(b"hello");
        let parsed = framer.parse(&framed).unwrap();
        assert_eq!(parsed.payloads, vec![&b"hello"[..]]);
        assert_eq!(parsed.consumed, framed.len());
    }

    #[test]
    fn test_multiple_frames_with_trailing_partial() {
        let framer = BinaryFramer::default();
        let big = vec![0xabu8; 300];

        let mut buf = Vec::new();
        framer.write_into(b"one", &mut buf);
        framer.write_into(&big, &mut buf);
        framer.write_into(b"", &mut buf);
        let complete_len = buf.len();

        // Incomplete trailing frame: prefix says 10, only 4 payload bytes
        buf.extend_from_slice(&[0x0a, 1, 2, 3, 4]);

        let parsed = framer.parse(&buf).unwrap();
        assert_eq!(parsed.payloads.len(), 3);
        assert_eq!(parsed.payloads[0], b"one");
        assert_eq!(parsed.payloads[1], &big[..]);
        assert!(parsed.payloads[2].is_empty());
        assert_eq!(parsed.consumed, complete_len);
    }

    #[test]
    fn test_incomplete_prefix_is_left_unconsumed() {
        let framer = BinaryFramer::default();
        let parsed = framer.parse(&[0x80]).unwrap();
        assert!(parsed.is_empty());
        assert_eq!(parsed.consumed, 0);
    }

    #[test]
    fn test_oversized_prefix_rejected_and_nothing_consumed() {
        let framer = BinaryFramer::new(100);
        let buf = framer.write(&[0u8; 101]);
        let err = framer.parse(&buf).unwrap_err();
        assert_eq!(err, ProtocolError::FrameTooLarge { length: 101, max: 100 });
    }

    #[test]
    fn test_oversized_prefix_rejected_before_payload_arrives() {
        let framer = BinaryFramer::new(100);
        // 0xe8 0x07 = 1000, no payload bytes at all
        let err = framer.parse(&[0xe8, 0x07]).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { length: 1000, .. }));
    }

    #[test]
    fn test_overlong_prefix_rejected() {
        let framer = BinaryFramer::new(usize::MAX);
        let err = framer.parse(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
    }

    #[test]
    fn test_bad_frame_after_good_frames_keeps_good_ones() {
        let framer = BinaryFramer::new(8);
        let mut buf = framer.write(b"ok");
        let good_len = buf.len();
        buf.push(0x7f); // declares 127 > 8

        let parsed = framer.parse(&buf).unwrap();
        assert_eq!(parsed.payloads, vec![&b"ok"[..]]);
        assert_eq!(parsed.consumed, good_len);

        let err = framer.parse(&buf[parsed.consumed..]).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_decoder_byte_at_a_time() {
        let framer = BinaryFramer::default();
        let framed = framer.write(b"xyz");

        let mut decoder = FrameDecoder::new(framer);
        for (i, byte) in framed.iter().enumerate() {
            let out = decoder.feed(&[*byte]).unwrap();
            if i < framed.len() - 1 {
                assert!(out.is_none());
                assert!(decoder.has_partial());
            } else {
                assert_eq!(out.unwrap().as_ref(), &framed[..]);
            }
        }
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_decoder_returns_complete_frames_and_keeps_rest() {
        let framer = BinaryFramer::default();
        let first = framer.write(b"first");
        let second = framer.write(b"second");

        let mut chunk = first.clone();
        chunk.extend_from_slice(&second[..3]);

        let mut decoder = FrameDecoder::default();
        let out = decoder.feed(&chunk).unwrap().unwrap();
        assert_eq!(out.as_ref(), &first[..]);
        assert!(decoder.has_partial());

        let out = decoder.feed(&second[3..]).unwrap().unwrap();
        assert_eq!(out.as_ref(), &second[..]);
        assert!(!decoder.has_partial());
    }
}
