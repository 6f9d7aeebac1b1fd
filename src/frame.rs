//! Length-prefixed framing (BERP).
//!
//! Every frame is a 4-byte big-endian payload length followed by exactly
//! that many payload bytes:
//!
//! ```text
//! +--------+--------+--------+--------+------------------+
//! |        length N (u32, big-endian) | N payload bytes  |
//! +--------+--------+--------+--------+------------------+
//! ```
//!
//! `FrameDecoder` turns an accumulation buffer into frames and does no I/O.
//! `FrameReader` drives it from an async byte stream. Bytes may arrive in
//! any chunking; leftover bytes stay buffered for the next frame.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Size of the length header
pub const HEADER_SIZE: usize = 4;

/// Default upper bound on a declared payload length
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024; // 64 MB

/// Initial read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Framing errors. Each one ends the affected connection only.
#[derive(Debug)]
pub enum FrameError {
    /// Header declares a payload larger than the configured maximum
    MalformedHeader { length: usize, max: usize },
    /// Stream ended after the header but before the full payload
    TruncatedFrame { expected: usize, received: usize },
    /// Outgoing payload does not fit in a u32 length header
    PayloadTooLarge(usize),
    /// Transport error
    Io(std::io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::MalformedHeader { length, max } => {
                write!(f, "frame length {length} exceeds maximum {max}")
            }
            FrameError::TruncatedFrame { expected, received } => {
                write!(
                    f,
                    "stream ended mid-frame: expected {expected} payload bytes, received {received}"
                )
            }
            FrameError::PayloadTooLarge(len) => {
                write!(f, "payload of {len} bytes does not fit in a frame")
            }
            FrameError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Decoder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Need the 4 header bytes
    Header,
    /// Header consumed, need `length` payload bytes
    Payload { length: usize },
}

/// Incremental frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a decoder with the default maximum frame size.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a decoder rejecting payloads larger than `max_frame_size`.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            state: State::Header,
            max_frame_size,
        }
    }

    /// Extract the next complete payload from `buffer`, if there is one.
    ///
    /// Consumed bytes are split off the front of the buffer; anything past
    /// the frame is left in place.
    pub fn decode(&mut self, buffer: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if let State::Header = self.state {
            if buffer.len() < HEADER_SIZE {
                return Ok(None);
            }

            let header = buffer.split_to(HEADER_SIZE);
            let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            if length > self.max_frame_size {
                return Err(FrameError::MalformedHeader {
                    length,
                    max: self.max_frame_size,
                });
            }

            self.state = State::Payload { length };
        }

        match self.state {
            State::Payload { length } if buffer.len() >= length => {
                self.state = State::Header;
                Ok(Some(buffer.split_to(length).freeze()))
            }
            State::Payload { length } => {
                // A header alone commits no memory; the buffer grows as
                // payload bytes actually arrive.
                buffer.reserve((length - buffer.len()).min(BUFFER_SIZE));
                Ok(None)
            }
            State::Header => Ok(None),
        }
    }

    /// True while a header has been read but its payload is incomplete.
    pub fn in_frame(&self) -> bool {
        matches!(self.state, State::Payload { .. })
    }

    fn expected_payload(&self) -> usize {
        match self.state {
            State::Payload { length } => length,
            State::Header => 0,
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads frames from an async byte stream.
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a stream with the default maximum frame size.
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_size(reader, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Wrap a stream rejecting payloads larger than `max_frame_size`.
    pub fn with_max_frame_size(reader: R, max_frame_size: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            decoder: FrameDecoder::with_max_frame_size(max_frame_size),
        }
    }

    /// Read the next frame payload.
    ///
    /// Returns `Ok(None)` when the stream ends before a complete header:
    /// the peer went away between frames, which is an ordinary disconnect.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        loop {
            if let Some(payload) = self.decoder.decode(&mut self.buffer)? {
                return Ok(Some(payload));
            }

            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.decoder.in_frame() {
                    return Err(FrameError::TruncatedFrame {
                        expected: self.decoder.expected_payload(),
                        received: self.buffer.len(),
                    });
                }
                if !self.buffer.is_empty() {
                    trace!(partial = self.buffer.len(), "Stream ended inside a header");
                }
                return Ok(None);
            }
        }
    }

    /// Number of bytes buffered but not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Build a complete frame (header + payload) in one buffer.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    let length =
        u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;
    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    frame.put_u32(length);
    frame.extend_from_slice(payload);
    Ok(frame.freeze())
}

/// Write one frame.
///
/// Header and payload go out in a single `write_all`, and the writer is
/// borrowed mutably for the duration, so frames on one connection can never
/// interleave.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frames_of<P: AsRef<[u8]>>(payloads: &[P]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for payload in payloads {
            bytes.extend_from_slice(&encode_frame(payload.as_ref()).unwrap());
        }
        bytes
    }

    fn decode_all(decoder: &mut FrameDecoder, buffer: &mut BytesMut) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(buffer).unwrap() {
            frames.push(frame);
        }
        frames
    }

    proptest! {
        #[test]
        fn reconstruction_ignores_chunking(
            payloads in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..200), 0..8),
            chunk_sizes in proptest::collection::vec(1usize..64, 1..32),
        ) {
            let wire = frames_of(&payloads[..]);

            let mut decoder = FrameDecoder::new();
            let mut buffer = BytesMut::new();
            let mut frames = Vec::new();
            let mut offset = 0;
            let mut sizes = chunk_sizes.iter().cycle();
            while offset < wire.len() {
                let size = (*sizes.next().unwrap()).min(wire.len() - offset);
                buffer.extend_from_slice(&wire[offset..offset + size]);
                offset += size;
                frames.extend(decode_all(&mut decoder, &mut buffer));
            }

            prop_assert!(buffer.is_empty());
            prop_assert_eq!(frames.len(), payloads.len());
            for (frame, payload) in frames.iter().zip(&payloads) {
                prop_assert_eq!(&frame[..], payload.as_slice());
            }
        }
    }

    #[test]
    fn test_encode_frame_header() {
        let frame = encode_frame(b"hello").unwrap();
        assert_eq!(&frame[..], b"\x00\x00\x00\x05hello");
    }

    #[test]
    fn test_single_frame_with_excess() {
        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::from(&frames_of(&["first", "sec"])[..]);
        buffer.truncate(buffer.len() - 1);

        let frame = decoder.decode(&mut buffer).unwrap();
        assert_eq!(frame.as_deref(), Some(&b"first"[..]));

        // Second frame is one byte short and stays buffered
        assert!(decoder.decode(&mut buffer).unwrap().is_none());
        assert!(decoder.in_frame());
        assert_eq!(buffer.len(), 2);

        buffer.extend_from_slice(b"c");
        let frame = decoder.decode(&mut buffer).unwrap();
        assert_eq!(frame.as_deref(), Some(&b"sec"[..]));
        assert!(!decoder.in_frame());
    }

    #[test]
    fn test_header_alone_does_not_reserve_declared_length() {
        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::from(&[0x04u8, 0, 0, 0][..]);

        assert!(decoder.decode(&mut buffer).unwrap().is_none());
        assert!(decoder.in_frame());
        assert!(
            buffer.capacity() <= 2 * BUFFER_SIZE,
            "header reserved {} bytes",
            buffer.capacity()
        );

        // The full payload is still accepted once it arrives
        let payload = vec![7u8; 3 * BUFFER_SIZE];
        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::from(&frames_of(&[&payload])[..HEADER_SIZE]);
        assert!(decoder.decode(&mut buffer).unwrap().is_none());
        for chunk in payload.chunks(BUFFER_SIZE / 2) {
            buffer.extend_from_slice(chunk);
            if let Some(frame) = decoder.decode(&mut buffer).unwrap() {
                assert_eq!(&frame[..], &payload[..]);
                return;
            }
        }
        panic!("frame never completed");
    }

    #[test]
    fn test_empty_payload() {
        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::from(&[0u8, 0, 0, 0][..]);
        let frame = decoder.decode(&mut buffer).unwrap();
        assert_eq!(frame.as_deref(), Some(&b""[..]));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let wire = frames_of(&["hi", "there"]);
        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::new();
        let mut frames = Vec::new();

        for byte in &wire {
            buffer.extend_from_slice(&[*byte]);
            frames.extend(decode_all(&mut decoder, &mut buffer));
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], b"hi");
        assert_eq!(&frames[1][..], b"there");
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut decoder = FrameDecoder::with_max_frame_size(16);
        let mut buffer = BytesMut::from(&[0u8, 0, 0, 17][..]);
        match decoder.decode(&mut buffer) {
            Err(FrameError::MalformedHeader { length, max }) => {
                assert_eq!(length, 17);
                assert_eq!(max, 16);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reader_chunked_input() {
        let wire = frames_of(&["abc", "defgh"]);
        let mock = tokio_test::io::Builder::new()
            .read(&wire[..1])
            .read(&wire[1..5])
            .read(&wire[5..9])
            .read(&wire[9..])
            .build();

        let mut reader = FrameReader::new(mock);
        assert_eq!(reader.read_frame().await.unwrap().as_deref(), Some(&b"abc"[..]));
        assert_eq!(reader.read_frame().await.unwrap().as_deref(), Some(&b"defgh"[..]));
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_eof_inside_header_is_clean() {
        let mock = tokio_test::io::Builder::new().read(&[0, 0]).build();
        let mut reader = FrameReader::new(mock);
        assert!(reader.read_frame().await.unwrap().is_none());
        assert_eq!(reader.buffered(), 2);
    }

    #[tokio::test]
    async fn test_reader_eof_inside_payload() {
        let mock = tokio_test::io::Builder::new()
            .read(&[0, 0, 0, 10, 1, 2, 3])
            .build();
        let mut reader = FrameReader::new(mock);
        match reader.read_frame().await {
            Err(FrameError::TruncatedFrame { expected, received }) => {
                assert_eq!(expected, 10);
                assert_eq!(received, 3);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_frame() {
        let mut mock = tokio_test::io::Builder::new()
            .write(b"\x00\x00\x00\x03abc")
            .build();
        write_frame(&mut mock, b"abc").await.unwrap();
    }
}
