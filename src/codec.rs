//! Device-side framing.
//!
//! Translates between the raw byte stream of a serial link and discrete [`Frame`]s.
//! The strategy is a closed set chosen per device in configuration:
//!
//! - **Delimiter**: a frame is every byte up to and including the delimiter.
//! - **Length-prefixed**: a big-endian unsigned length (1, 2 or 4 bytes) followed by
//!   that many payload bytes.
//!
//! Decoding is incremental. Bytes are [`fed`](FrameDecoder::feed) as they arrive and
//! [`decode`](FrameDecoder::decode) yields at most one frame per call; a frame is only
//! ever handed out whole. Input that cannot be a valid frame is reported as
//! [`DecodeOutcome::Malformed`] and the decoder skips forward to the next plausible
//! frame boundary on its own.
//!
//! # Example
//!
//! ```
//! use serial_gateway::codec::{DecodeOutcome, Frame, FrameCodec};
//!
//! let codec = FrameCodec::delimited(b"\n".to_vec(), 256);
//! let bytes = codec.encode(&Frame::from_network("PING")).unwrap();
//! assert_eq!(&bytes[..], b"PING\n");
//!
//! let mut decoder = codec.decoder();
//! decoder.feed(b"PO");
//! assert!(matches!(decoder.decode(), DecodeOutcome::Incomplete));
//! decoder.feed(b"NG\n");
//! match decoder.decode() {
//!     DecodeOutcome::Frame(frame) => assert_eq!(&frame.payload[..], b"PONG\n"),
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;

use crate::config::FramingConfig;
use crate::error::FrameError;

/// Where a frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameOrigin {
    /// Built from a client request
    Network,
    /// Decoded from device output
    Device,
}

/// One complete logical message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame bytes as seen by the consumer
    pub payload: Bytes,
    /// Correlation identifier, when the exchange carries one
    pub sequence: Option<u64>,
    /// Producer of the frame
    pub origin: FrameOrigin,
}

impl Frame {
    /// A frame built from a network request
    pub fn from_network(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            sequence: None,
            origin: FrameOrigin::Network,
        }
    }

    /// A frame decoded from device output
    pub fn from_device(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            sequence: None,
            origin: FrameOrigin::Device,
        }
    }

    /// Attach a correlation identifier
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// Result of one decode attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A complete frame was assembled
    Frame(Frame),
    /// More bytes are needed
    Incomplete,
    /// Buffered input could not form a frame and was skipped
    Malformed(String),
}

/// Framing strategy for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameCodec {
    /// Frames terminated by a delimiter
    Delimiter {
        /// Terminator byte sequence
        delimiter: Bytes,
        /// Maximum frame size including the delimiter
        max_frame_bytes: usize,
    },
    /// Frames preceded by a big-endian length
    LengthPrefixed {
        /// Prefix width in bytes (1, 2 or 4)
        prefix_bytes: u8,
        /// Maximum payload size
        max_frame_bytes: usize,
    },
}

impl FrameCodec {
    /// Delimiter-based codec
    pub fn delimited(delimiter: impl Into<Bytes>, max_frame_bytes: usize) -> Self {
        FrameCodec::Delimiter {
            delimiter: delimiter.into(),
            max_frame_bytes,
        }
    }

    /// Length-prefixed codec
    pub fn length_prefixed(prefix_bytes: u8, max_frame_bytes: usize) -> Self {
        FrameCodec::LengthPrefixed {
            prefix_bytes,
            max_frame_bytes,
        }
    }

    /// Build the codec a device is configured with
    pub fn from_config(config: &FramingConfig) -> Self {
        match config {
            FramingConfig::Delimiter {
                delimiter,
                max_frame_bytes,
            } => Self::delimited(delimiter.clone().into_bytes(), *max_frame_bytes),
            FramingConfig::LengthPrefixed {
                prefix_bytes,
                max_frame_bytes,
            } => Self::length_prefixed(*prefix_bytes, *max_frame_bytes),
        }
    }

    /// Largest frame this codec accepts
    pub fn max_frame_bytes(&self) -> usize {
        match self {
            FrameCodec::Delimiter {
                max_frame_bytes, ..
            }
            | FrameCodec::LengthPrefixed {
                max_frame_bytes, ..
            } => *max_frame_bytes,
        }
    }

    /// Encode a frame for the wire
    ///
    /// Delimited frames get the delimiter appended unless the payload already ends
    /// with it. A payload carrying the delimiter anywhere else would reach the
    /// device as two frames and is rejected.
    pub fn encode(&self, frame: &Frame) -> Result<Bytes, FrameError> {
        let payload = &frame.payload[..];
        match self {
            FrameCodec::Delimiter {
                delimiter,
                max_frame_bytes,
            } => {
                let body = payload.strip_suffix(&delimiter[..]).unwrap_or(payload);
                if find_subsequence(body, delimiter).is_some() {
                    return Err(FrameError::EmbeddedDelimiter);
                }
                let len = body.len() + delimiter.len();
                if len > *max_frame_bytes {
                    return Err(FrameError::TooLarge {
                        len,
                        max: *max_frame_bytes,
                    });
                }
                let mut out = BytesMut::with_capacity(len);
                out.extend_from_slice(body);
                out.extend_from_slice(delimiter);
                Ok(out.freeze())
            }
            FrameCodec::LengthPrefixed {
                prefix_bytes,
                max_frame_bytes,
            } => {
                if payload.len() > *max_frame_bytes {
                    return Err(FrameError::TooLarge {
                        len: payload.len(),
                        max: *max_frame_bytes,
                    });
                }
                let width = usize::from(*prefix_bytes);
                let len_be = (payload.len() as u64).to_be_bytes();
                let mut out = BytesMut::with_capacity(width + payload.len());
                out.extend_from_slice(&len_be[len_be.len() - width..]);
                out.extend_from_slice(payload);
                Ok(out.freeze())
            }
        }
    }

    /// Fresh decoder for device output
    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder::new(self.clone(), FrameOrigin::Device)
    }
}

/// Incremental, stateful frame decoder
#[derive(Debug)]
pub struct FrameDecoder {
    codec: FrameCodec,
    origin: FrameOrigin,
    buf: BytesMut,
    /// Set after a delimiter overflow: drop bytes until the next delimiter.
    skipping: bool,
}

impl FrameDecoder {
    /// Decoder producing frames tagged with `origin`
    pub fn new(codec: FrameCodec, origin: FrameOrigin) -> Self {
        Self {
            codec,
            origin,
            buf: BytesMut::new(),
            skipping: false,
        }
    }

    /// Append bytes read from the link
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes buffered but not yet part of a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop all buffered bytes and any pending resynchronization
    pub fn reset(&mut self) {
        self.buf.clear();
        self.skipping = false;
    }

    /// Try to take one frame out of the buffer
    pub fn decode(&mut self) -> DecodeOutcome {
        match self.codec.clone() {
            FrameCodec::Delimiter {
                delimiter,
                max_frame_bytes,
            } => self.decode_delimited(&delimiter, max_frame_bytes),
            FrameCodec::LengthPrefixed {
                prefix_bytes,
                max_frame_bytes,
            } => self.decode_length_prefixed(usize::from(prefix_bytes), max_frame_bytes),
        }
    }

    fn decode_delimited(&mut self, delimiter: &[u8], max_frame_bytes: usize) -> DecodeOutcome {
        if self.skipping {
            match find_subsequence(&self.buf, delimiter) {
                Some(pos) => {
                    self.buf.advance(pos + delimiter.len());
                    self.skipping = false;
                }
                None => {
                    // Keep a tail that may be the start of a split delimiter.
                    let keep = delimiter.len().saturating_sub(1).min(self.buf.len());
                    let drop = self.buf.len() - keep;
                    self.buf.advance(drop);
                    return DecodeOutcome::Incomplete;
                }
            }
        }

        match find_subsequence(&self.buf, delimiter) {
            Some(pos) => {
                let frame_len = pos + delimiter.len();
                if frame_len > max_frame_bytes {
                    self.buf.advance(frame_len);
                    return DecodeOutcome::Malformed(format!(
                        "frame of {} bytes exceeds the maximum of {}",
                        frame_len, max_frame_bytes
                    ));
                }
                let payload = self.buf.split_to(frame_len).freeze();
                DecodeOutcome::Frame(self.frame(payload))
            }
            None if self.buf.len() >= max_frame_bytes => {
                let seen = self.buf.len();
                let keep = delimiter.len().saturating_sub(1);
                self.buf.advance(seen.saturating_sub(keep));
                self.skipping = true;
                DecodeOutcome::Malformed(format!(
                    "no delimiter within {} bytes",
                    max_frame_bytes
                ))
            }
            None => DecodeOutcome::Incomplete,
        }
    }

    fn decode_length_prefixed(&mut self, width: usize, max_frame_bytes: usize) -> DecodeOutcome {
        if self.buf.len() < width {
            return DecodeOutcome::Incomplete;
        }
        let len = self.buf[..width]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
        if len > max_frame_bytes {
            self.buf.advance(width);
            return DecodeOutcome::Malformed(format!(
                "length prefix {} exceeds the maximum of {}",
                len, max_frame_bytes
            ));
        }
        if self.buf.len() < width + len {
            return DecodeOutcome::Incomplete;
        }
        self.buf.advance(width);
        let payload = self.buf.split_to(len).freeze();
        DecodeOutcome::Frame(self.frame(payload))
    }

    fn frame(&self, payload: Bytes) -> Frame {
        Frame {
            payload,
            sequence: None,
            origin: self.origin,
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut FrameDecoder) -> Vec<DecodeOutcome> {
        let mut out = Vec::new();
        loop {
            match decoder.decode() {
                DecodeOutcome::Incomplete => return out,
                other => out.push(other),
            }
        }
    }

    fn payloads(outcomes: &[DecodeOutcome]) -> Vec<Vec<u8>> {
        outcomes
            .iter()
            .filter_map(|o| match o {
                DecodeOutcome::Frame(f) => Some(f.payload.to_vec()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_delimiter_appended_once() {
        let codec = FrameCodec::delimited(b"\r\n".to_vec(), 64);
        let a = codec.encode(&Frame::from_network("*IDN?")).unwrap();
        let b = codec.encode(&Frame::from_network("*IDN?\r\n")).unwrap();
        assert_eq!(&a[..], b"*IDN?\r\n");
        assert_eq!(a, b);
    }

    #[test]
    fn test_embedded_delimiter_rejected() {
        let codec = FrameCodec::delimited(b"\n".to_vec(), 64);
        let err = codec.encode(&Frame::from_network("A\nB\n")).unwrap_err();
        assert_eq!(err, FrameError::EmbeddedDelimiter);
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let codec = FrameCodec::length_prefixed(1, 4);
        let err = codec.encode(&Frame::from_network("12345")).unwrap_err();
        assert_eq!(err, FrameError::TooLarge { len: 5, max: 4 });
    }

    #[test]
    fn test_byte_at_a_time_delimited() {
        let codec = FrameCodec::delimited(b"\r\n".to_vec(), 64);
        let mut decoder = codec.decoder();
        let mut frames = Vec::new();
        for byte in b"OK\r\nERR 3\r\n" {
            decoder.feed(&[*byte]);
            frames.extend(drain(&mut decoder));
        }
        assert_eq!(
            payloads(&frames),
            vec![b"OK\r\n".to_vec(), b"ERR 3\r\n".to_vec()]
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_several_frames_in_one_chunk() {
        let codec = FrameCodec::length_prefixed(2, 64);
        let mut decoder = codec.decoder();
        decoder.feed(&[0, 2, b'h', b'i', 0, 0, 0, 3, b'a', b'b']);
        let out = drain(&mut decoder);
        assert_eq!(payloads(&out), vec![b"hi".to_vec(), Vec::new()]);
        assert_eq!(decoder.buffered(), 4);

        decoder.feed(b"c");
        let out = drain(&mut decoder);
        assert_eq!(payloads(&out), vec![b"abc".to_vec()]);
    }

    #[test]
    fn test_round_trip_up_to_max_size() {
        let max = 300;
        let prefixed = FrameCodec::length_prefixed(2, max);
        let delimited = FrameCodec::delimited(b"\n".to_vec(), max);

        for len in [0usize, 1, 2, 17, 255, 256, max - 1] {
            let body: Vec<u8> = (0..len).map(|i| b'a' + (i % 26) as u8).collect();

            let frame = Frame::from_device(body.clone());
            let mut decoder = prefixed.decoder();
            decoder.feed(&prefixed.encode(&frame).unwrap());
            assert_eq!(decoder.decode(), DecodeOutcome::Frame(frame));

            let mut line = body.clone();
            line.push(b'\n');
            let frame = Frame::from_device(line);
            let mut decoder = delimited.decoder();
            decoder.feed(&delimited.encode(&frame).unwrap());
            assert_eq!(decoder.decode(), DecodeOutcome::Frame(frame));
        }
    }

    #[test]
    fn test_oversized_length_prefix_is_malformed() {
        let codec = FrameCodec::length_prefixed(2, 8);
        let mut decoder = codec.decoder();
        decoder.feed(&[0xFF, 0xFF, 0, 2, b'o', b'k']);

        assert!(matches!(decoder.decode(), DecodeOutcome::Malformed(_)));
        match decoder.decode() {
            DecodeOutcome::Frame(frame) => assert_eq!(&frame.payload[..], b"ok"),
            other => panic!("expected resynchronized frame, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_delimiter_skips_to_next_boundary() {
        let codec = FrameCodec::delimited(b"\n".to_vec(), 8);
        let mut decoder = codec.decoder();

        decoder.feed(b"0123456789");
        assert!(matches!(decoder.decode(), DecodeOutcome::Malformed(_)));

        // Tail of the runaway frame is dropped, never handed out as a frame.
        decoder.feed(b"abc\nOK\n");
        let out = drain(&mut decoder);
        assert_eq!(payloads(&out), vec![b"OK\n".to_vec()]);
    }

    #[test]
    fn test_long_frame_with_delimiter_is_malformed() {
        let codec = FrameCodec::delimited(b"\n".to_vec(), 4);
        let mut decoder = codec.decoder();
        decoder.feed(b"abcdef\nok\n");
        let out = drain(&mut decoder);
        assert!(matches!(out[0], DecodeOutcome::Malformed(_)));
        assert_eq!(payloads(&out), vec![b"ok\n".to_vec()]);
    }

    #[test]
    fn test_split_delimiter_across_skip() {
        let codec = FrameCodec::delimited(b"\r\n".to_vec(), 4);
        let mut decoder = codec.decoder();
        decoder.feed(b"xxxxxx\r");
        assert!(matches!(decoder.decode(), DecodeOutcome::Malformed(_)));
        decoder.feed(b"\nhi\r\n");
        let out = drain(&mut decoder);
        assert_eq!(payloads(&out), vec![b"hi\r\n".to_vec()]);
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let codec = FrameCodec::delimited(b"\n".to_vec(), 64);
        let mut decoder = codec.decoder();
        decoder.feed(b"stale-partial");
        decoder.reset();
        decoder.feed(b"fresh\n");
        let out = drain(&mut decoder);
        assert_eq!(payloads(&out), vec![b"fresh\n".to_vec()]);
    }

    #[test]
    fn test_from_config() {
        let codec = FrameCodec::from_config(&FramingConfig::default());
        assert_eq!(codec, FrameCodec::delimited(b"\n".to_vec(), 4096));
        assert_eq!(codec.max_frame_bytes(), 4096);
    }
}
