//! Serial PnP framing: start-of-frame delimiting and byte escaping.
//!
//! On the wire every packet is sent as
//!
//! ```text
//! +------+--------------------------------------+
//! | 0x5A | escaped(length:u16le type:u8 rsv:u8 payload...) |
//! +------+--------------------------------------+
//! ```
//!
//! Any `0x5A` or `0xEF` inside the packet is replaced by `0xEF, byte - 1`.
//! The decoder adds the one back after an escape marker.

use super::FrameError;

pub const START_OF_FRAME: u8 = 0x5A;
pub const ESCAPE: u8 = 0xEF;
pub const MIN_PACKET_LENGTH: usize = 4;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4096;

fn needs_escape(byte: u8) -> bool {
    byte == START_OF_FRAME || byte == ESCAPE
}

/// Escape a raw packet body without the start marker.
pub fn escape(raw: &[u8]) -> Vec<u8> {
    let extra = raw.iter().filter(|b| needs_escape(**b)).count();
    let mut out = Vec::with_capacity(raw.len() + extra);
    for &byte in raw {
        if needs_escape(byte) {
            out.push(ESCAPE);
            out.push(byte - 1);
        } else {
            out.push(byte);
        }
    }
    out
}

/// Reverse of [`escape`]. A dangling escape marker at the end is dropped.
pub fn unescape(wire: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(wire.len());
    let mut escaped = false;
    for &byte in wire {
        if byte == ESCAPE {
            escaped = true;
            continue;
        }
        if escaped {
            out.push(byte.wrapping_add(1));
            escaped = false;
        } else {
            out.push(byte);
        }
    }
    out
}

/// Streaming frame decoder, fed one byte at a time from the receive loop.
#[derive(Debug)]
pub struct FrameCodec {
    buffer: Vec<u8>,
    max_frame_size: usize,
    escaped: bool,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_capacity(max_frame_size: usize) -> Self {
        let max_frame_size = max_frame_size.clamp(MIN_PACKET_LENGTH, u16::MAX as usize);
        Self {
            buffer: Vec::with_capacity(max_frame_size),
            max_frame_size,
            escaped: false,
        }
    }

    /// Wrap a raw packet (header + payload) for transmission.
    pub fn encode(raw_packet: &[u8]) -> Vec<u8> {
        let mut wire = Vec::with_capacity(raw_packet.len() + 8);
        wire.push(START_OF_FRAME);
        wire.extend_from_slice(&escape(raw_packet));
        wire
    }

    /// Consume one wire byte. Returns the unescaped packet once its declared
    /// length has been accumulated.
    ///
    /// An unescaped `0x5A` always restarts the frame, discarding any partial
    /// data. A declared length larger than the buffer or shorter than the
    /// header is a fatal [`FrameError`]; the codec is reset before returning it.
    pub fn feed(&mut self, byte: u8) -> Result<Option<Vec<u8>>, FrameError> {
        if byte == START_OF_FRAME {
            self.reset();
            return Ok(None);
        }

        if byte == ESCAPE {
            self.escaped = true;
            return Ok(None);
        }

        let value = if self.escaped {
            self.escaped = false;
            byte.wrapping_add(1)
        } else {
            byte
        };

        self.buffer.push(value);

        if self.buffer.len() < MIN_PACKET_LENGTH {
            return Ok(None);
        }

        let declared = u16::from_le_bytes([self.buffer[0], self.buffer[1]]) as usize;
        if declared < MIN_PACKET_LENGTH {
            self.reset();
            return Err(FrameError::MalformedHeader { length: declared });
        }
        if declared > self.max_frame_size {
            self.reset();
            return Err(FrameError::BufferOverflow {
                length: declared,
                capacity: self.max_frame_size,
            });
        }

        if self.buffer.len() == declared {
            let frame = std::mem::take(&mut self.buffer);
            self.buffer.reserve(self.max_frame_size);
            return Ok(Some(frame));
        }

        Ok(None)
    }

    /// Feed a chunk, collecting every frame completed along the way.
    pub fn feed_slice(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        let mut frames = Vec::new();
        for &byte in data {
            if let Some(frame) = self.feed(byte)? {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    /// Number of decoded bytes held for the frame in progress.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.escaped = false;
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(packet_type: u8, payload: &[u8]) -> Vec<u8> {
        let len = (4 + payload.len()) as u16;
        let mut raw = len.to_le_bytes().to_vec();
        raw.push(packet_type);
        raw.push(0);
        raw.extend_from_slice(payload);
        raw
    }

    #[test]
    fn test_escape_marker_bytes() {
        assert_eq!(escape(&[0x5A]), vec![0xEF, 0x59]);
        assert_eq!(escape(&[0xEF]), vec![0xEF, 0xEE]);
        assert_eq!(escape(&[0x01, 0x02]), vec![0x01, 0x02]);
    }

    #[test]
    fn test_escape_round_trip_all_adjacencies() {
        let alphabet = [0x00u8, 0x59, 0x5A, 0x5B, 0xEE, 0xEF, 0xF0, 0xFF];
        for &a in &alphabet {
            for &b in &alphabet {
                for &c in &alphabet {
                    let raw = [a, b, c];
                    let wire = escape(&raw);
                    assert!(!wire.contains(&START_OF_FRAME), "marker leaked for {:?}", raw);
                    assert_eq!(unescape(&wire), raw.to_vec());
                }
            }
        }
    }

    #[test]
    fn test_reset_request_encoding() {
        let wire = FrameCodec::encode(&packet(0x01, &[]));
        assert_eq!(wire, vec![0x5A, 0x04, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_decode_single_frame() {
        let raw = packet(0x0A, &[0x00, 0x01, b't', 0x5A, 0xEF]);
        let mut codec = FrameCodec::new();
        let frames = codec.feed_slice(&FrameCodec::encode(&raw)).unwrap();
        assert_eq!(frames, vec![raw]);
        assert_eq!(codec.buffered_len(), 0);
    }

    #[test]
    fn test_length_byte_equal_to_marker_is_escaped() {
        // 0x5A bytes long: the length field itself collides with the start marker
        let payload = vec![0x11; 0x5A - 4];
        let raw = packet(0x04, &payload);
        assert_eq!(raw[0], 0x5A);
        let wire = FrameCodec::encode(&raw);
        assert_eq!(&wire[..3], &[0x5A, 0xEF, 0x59]);

        let mut codec = FrameCodec::new();
        assert_eq!(codec.feed_slice(&wire).unwrap(), vec![raw]);
    }

    #[test]
    fn test_start_marker_resynchronizes() {
        let first = packet(0x06, &[1, 2, 3, 4]);
        let second = packet(0x02, &[]);
        let mut wire = FrameCodec::encode(&first);
        wire.truncate(4); // interrupted mid-frame
        wire.extend_from_slice(&FrameCodec::encode(&second));

        let mut codec = FrameCodec::new();
        assert_eq!(codec.feed_slice(&wire).unwrap(), vec![second]);
    }

    #[test]
    fn test_malformed_header_is_fatal() {
        let mut codec = FrameCodec::new();
        let result = codec.feed_slice(&[0x5A, 0x02, 0x00, 0x01, 0x00]);
        assert!(matches!(result, Err(FrameError::MalformedHeader { length: 2 })));
        assert_eq!(codec.buffered_len(), 0);
    }

    #[test]
    fn test_oversized_declared_length() {
        let mut codec = FrameCodec::with_capacity(16);
        let result = codec.feed_slice(&[0x5A, 0x20, 0x00, 0x01, 0x00]);
        assert!(matches!(result, Err(FrameError::BufferOverflow { length: 0x20, capacity: 16 })));
        assert_eq!(codec.buffered_len(), 0);
    }

    #[test]
    fn test_garbage_after_frame_overflows() {
        let mut codec = FrameCodec::with_capacity(8);
        let frames = codec.feed_slice(&[0x5A, 0x04, 0x00, 0x07, 0x00]).unwrap();
        assert_eq!(frames.len(), 1);
        // No new start marker: trailing noise is read as a header claiming 0x1001 bytes.
        let result = codec.feed_slice(&[0x01, 0x10, 0x00, 0x00]);
        assert!(matches!(result, Err(FrameError::BufferOverflow { length: 0x1001, .. })));
    }
}
