//! Byte-stuffed frame codec
//!
//! Every packet exchanged with the radio travels in a frame:
//!
//! ```text
//! 0x94 | stuff(body || crc16_le(body)) | 0x7E
//! ```
//!
//! Inside the stuffed region the bytes `0x94`, `0x7E` and `0x7D` are written
//! as `0x7D, byte ^ 0x20`, so markers never appear unescaped between a start
//! and its end. Transports deliver bytes in arbitrary chunks; [`FrameCodec`]
//! reassembles them and yields each complete frame body exactly once.
//!
//! Corruption never stalls the stream. A bad checksum, a bad escape, a
//! frame cut short by a fresh start marker, or a frame that grows past the
//! size bound is reported as a [`FrameError`] for that span, and decoding
//! resumes at the next start marker.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{trace, warn};

use crate::config::{DEFAULT_MAX_PACKET_SIZE, ESCAPE_XOR, FRAME_END, FRAME_ESCAPE, FRAME_START};
use crate::crc;
use crate::error::FrameError;

/// Codec counters for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecStats {
    /// Frames yielded with a valid checksum
    pub frames_decoded: u64,
    /// Spans reported as errors
    pub frame_errors: u64,
    /// Noise bytes skipped while looking for a start marker
    pub bytes_skipped: u64,
}

/// Incremental frame reassembler.
///
/// One codec per transport stream; it holds the partial frame between
/// `feed` calls.
#[derive(Debug)]
pub struct FrameCodec {
    buffer: BytesMut,
    max_packet_size: usize,
    stats: CodecStats,
}

impl FrameCodec {
    /// Create a codec with the default packet-size ceiling
    pub fn new() -> Self {
        Self::with_max_packet_size(DEFAULT_MAX_PACKET_SIZE)
    }

    /// Create a codec with a custom packet-size ceiling
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_packet_size * 2),
            max_packet_size,
            stats: CodecStats::default(),
        }
    }

    /// Largest body this codec accepts
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Worst-case wire size of an acceptable frame: every body and CRC byte
    /// escaped, plus both markers.
    pub fn max_frame_size(&self) -> usize {
        2 * (self.max_packet_size + 2) + 2
    }

    /// Append bytes without extracting frames
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Append bytes and return an iterator over the frames now complete.
    ///
    /// The iterator is lazy. Frames not pulled before it is dropped stay
    /// buffered and are yielded by the next `feed` or `next_frame`.
    pub fn feed(&mut self, bytes: &[u8]) -> Frames<'_> {
        self.push(bytes);
        Frames { codec: self }
    }

    /// Extract the next complete frame body, if any.
    ///
    /// Returns `None` when the buffer holds no complete frame.
    pub fn next_frame(&mut self) -> Option<Result<Bytes, FrameError>> {
        match self.buffer.iter().position(|&b| b == FRAME_START) {
            None => {
                if !self.buffer.is_empty() {
                    self.skip(self.buffer.len());
                }
                return None;
            }
            Some(0) => {}
            Some(pos) => self.skip(pos),
        }

        // buffer[0] is a start marker; find whichever marker comes next
        let next_marker = self.buffer[1..]
            .iter()
            .position(|&b| b == FRAME_END || b == FRAME_START)
            .map(|i| i + 1);

        let result = match next_marker {
            None => {
                let max = self.max_frame_size();
                if self.buffer.len() <= max {
                    trace!(buffered = self.buffer.len(), "Waiting for end of frame");
                    return None;
                }
                let size = self.buffer.len();
                self.buffer.clear();
                Err(FrameError::FrameTooLarge { size, max })
            }
            Some(idx) if self.buffer[idx] == FRAME_START => {
                self.buffer.advance(idx);
                Err(FrameError::Truncated { discarded: idx })
            }
            Some(idx) => {
                let frame = self.buffer.split_to(idx + 1);
                self.check_frame(&frame[1..idx])
            }
        };

        match &result {
            Ok(body) => {
                self.stats.frames_decoded += 1;
                trace!(size = body.len(), "Decoded frame");
            }
            Err(e) => {
                self.stats.frame_errors += 1;
                warn!(error = %e, "Dropping corrupt frame");
            }
        }
        Some(result)
    }

    /// Frame a body for transmission
    pub fn encode(body: &[u8]) -> Bytes {
        let checksum = crc::compute(body);
        let mut out = BytesMut::with_capacity(body.len() + body.len() / 8 + 6);
        out.put_u8(FRAME_START);
        for &b in body.iter().chain(checksum.to_le_bytes().iter()) {
            if matches!(b, FRAME_START | FRAME_END | FRAME_ESCAPE) {
                out.put_u8(FRAME_ESCAPE);
                out.put_u8(b ^ ESCAPE_XOR);
            } else {
                out.put_u8(b);
            }
        }
        out.put_u8(FRAME_END);
        out.freeze()
    }

    /// Bytes held for a frame that has not completed yet
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Codec counters
    pub fn stats(&self) -> CodecStats {
        self.stats
    }

    fn skip(&mut self, n: usize) {
        trace!(skipped = n, "Skipping bytes outside a frame");
        self.stats.bytes_skipped += n as u64;
        self.buffer.advance(n);
    }

    fn check_frame(&self, stuffed: &[u8]) -> Result<Bytes, FrameError> {
        let mut raw = unstuff(stuffed)?;
        if raw.len() < 2 {
            return Err(FrameError::TooShort { len: raw.len() });
        }
        let body_len = raw.len() - 2;
        let expected = u16::from_le_bytes([raw[body_len], raw[body_len + 1]]);
        raw.truncate(body_len);

        if body_len > self.max_packet_size {
            return Err(FrameError::FrameTooLarge {
                size: body_len,
                max: self.max_packet_size,
            });
        }

        let actual = crc::compute(&raw);
        if actual != expected {
            return Err(FrameError::CrcMismatch { expected, actual });
        }
        Ok(Bytes::from(raw))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn unstuff(stuffed: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(stuffed.len());
    let mut iter = stuffed.iter().enumerate();
    while let Some((offset, &b)) = iter.next() {
        if b != FRAME_ESCAPE {
            out.push(b);
            continue;
        }
        let original = match iter.next() {
            Some((_, &escaped)) => escaped ^ ESCAPE_XOR,
            None => return Err(FrameError::InvalidEscape { offset }),
        };
        if !matches!(original, FRAME_START | FRAME_END | FRAME_ESCAPE) {
            return Err(FrameError::InvalidEscape { offset });
        }
        out.push(original);
    }
    Ok(out)
}

/// Lazy iterator over the frames available in a [`FrameCodec`]
#[derive(Debug)]
pub struct Frames<'a> {
    codec: &'a mut FrameCodec,
}

impl Iterator for Frames<'_> {
    type Item = Result<Bytes, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.codec.next_frame()
    }
}
