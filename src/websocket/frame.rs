//! WebSocket frame codec (RFC 6455 §5.2)
//!
//! Frame layout:
//! - byte 0: FIN (bit 7), opcode (bits 0-3)
//! - byte 1: MASK (bit 7), length code (bits 0-6)
//! - length code 0-125: literal payload length
//! - length code 126: next 2 bytes, big-endian u16
//! - length code 127: next 8 bytes, big-endian u64
//! - masking key: 4 bytes, present only when MASK is set
//! - payload: `length` bytes, XOR-ed with `key[i % 4]` when masked
//!
//! Server frames are always unmasked. Opcodes are decoded but not used for
//! routing: every final frame is handled as a text message.

use super::error::{FrameError, FrameResult};

const FIN_BIT: u8 = 0x80;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LENGTH_BITS: u8 = 0x7F;
const LENGTH_16: u8 = 126;
const LENGTH_64: u8 = 127;

/// Largest payload length that fits in the 7-bit length code
pub const MAX_INLINE_LENGTH: usize = 125;

/// Frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl OpCode {
    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Reserved(code) => code & OPCODE_BITS,
        }
    }
}

impl From<u8> for OpCode {
    fn from(code: u8) -> Self {
        match code & OPCODE_BITS {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            other => OpCode::Reserved(other),
        }
    }
}

/// A decoded WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final-fragment flag
    pub fin: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Unmasked payload bytes
    pub payload: Vec<u8>,
}

/// Parsed frame header
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    fin: bool,
    opcode: OpCode,
    payload_len: u64,
    mask: Option<[u8; 4]>,
    /// Header bytes including the masking key
    len: usize,
}

impl FrameHeader {
    /// Parse the header, or `None` if `buf` does not hold all of it yet
    fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < 2 {
            return None;
        }

        let fin = buf[0] & FIN_BIT != 0;
        let opcode = OpCode::from(buf[0]);
        let masked = buf[1] & MASK_BIT != 0;

        let (payload_len, mut len) = match buf[1] & LENGTH_BITS {
            LENGTH_16 => {
                let bytes: [u8; 2] = buf.get(2..4)?.try_into().ok()?;
                (u64::from(u16::from_be_bytes(bytes)), 4)
            }
            LENGTH_64 => {
                let bytes: [u8; 8] = buf.get(2..10)?.try_into().ok()?;
                (u64::from_be_bytes(bytes), 10)
            }
            code => (u64::from(code), 2),
        };

        let mask = if masked {
            let key: [u8; 4] = buf.get(len..len + 4)?.try_into().ok()?;
            len += 4;
            Some(key)
        } else {
            None
        };

        Some(Self {
            fin,
            opcode,
            payload_len,
            mask,
            len,
        })
    }

    /// Minimum number of header bytes implied by the first two bytes
    fn min_len(buf: &[u8]) -> usize {
        if buf.len() < 2 {
            return 2;
        }
        let extended = match buf[1] & LENGTH_BITS {
            LENGTH_16 => 2,
            LENGTH_64 => 8,
            _ => 0,
        };
        let mask = if buf[1] & MASK_BIT != 0 { 4 } else { 0 };
        2 + extended + mask
    }
}

impl Frame {
    /// Create a final text frame
    pub fn text(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode: OpCode::Text,
            payload: payload.into(),
        }
    }

    /// Whether this frame completes a message
    pub fn is_final(&self) -> bool {
        self.fin
    }

    /// Payload as text, replacing invalid UTF-8 sequences
    pub fn payload_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Decode one frame from the front of `buf`
    ///
    /// Returns `Ok(None)` while `buf` holds less than the full frame, and the
    /// frame together with the number of bytes it occupied otherwise.
    /// Payloads declared larger than `max_payload` are rejected before any
    /// payload bytes are buffered.
    pub fn decode(buf: &[u8], max_payload: usize) -> FrameResult<Option<(Frame, usize)>> {
        let Some(header) = FrameHeader::parse(buf) else {
            return Ok(None);
        };

        let too_large = FrameError::TooLarge {
            length: header.payload_len,
            limit: max_payload,
        };
        let payload_len = match usize::try_from(header.payload_len) {
            Ok(len) if len <= max_payload => len,
            _ => return Err(too_large),
        };
        let total = header.len.checked_add(payload_len).ok_or(too_large)?;

        if buf.len() < total {
            return Ok(None);
        }

        let mut payload = buf[header.len..total].to_vec();
        if let Some(key) = header.mask {
            apply_mask(&mut payload, key);
        }

        let frame = Frame {
            fin: header.fin,
            opcode: header.opcode,
            payload,
        };
        Ok(Some((frame, total)))
    }

    /// Decode a frame that must be fully contained in `buf`
    pub fn parse(buf: &[u8]) -> FrameResult<Frame> {
        match Self::decode(buf, usize::MAX)? {
            Some((frame, _)) => Ok(frame),
            None => {
                let needed = match FrameHeader::parse(buf) {
                    Some(header) => usize::try_from(header.payload_len)
                        .map(|len| header.len.saturating_add(len))
                        .unwrap_or(usize::MAX),
                    None => FrameHeader::min_len(buf),
                };
                Err(FrameError::Truncated {
                    needed,
                    available: buf.len(),
                })
            }
        }
    }

    /// Encode as an unmasked server frame
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.write_header(&mut out, None);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Encode as a masked client frame
    pub fn encode_masked(&self, key: [u8; 4]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len() + 4);
        self.write_header(&mut out, Some(key));
        let start = out.len();
        out.extend_from_slice(&self.payload);
        apply_mask(&mut out[start..], key);
        out
    }

    /// Size of the unmasked encoding in bytes
    pub fn encoded_len(&self) -> usize {
        let len = self.payload.len();
        let header = if len <= MAX_INLINE_LENGTH {
            2
        } else if len <= usize::from(u16::MAX) {
            4
        } else {
            10
        };
        header + len
    }

    fn write_header(&self, out: &mut Vec<u8>, mask: Option<[u8; 4]>) {
        let fin = if self.fin { FIN_BIT } else { 0 };
        out.push(fin | self.opcode.as_u8());

        let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
        let len = self.payload.len();
        if len <= MAX_INLINE_LENGTH {
            out.push(mask_bit | len as u8);
        } else if let Ok(short) = u16::try_from(len) {
            out.push(mask_bit | LENGTH_16);
            out.extend_from_slice(&short.to_be_bytes());
        } else {
            out.push(mask_bit | LENGTH_64);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        if let Some(key) = mask {
            out.extend_from_slice(&key);
        }
    }
}

/// Encode a text message as a final, unmasked server frame
pub fn encode_text(message: &str) -> Vec<u8> {
    Frame::text(message).encode()
}

/// XOR `payload[i]` with `key[i % 4]` in place
///
/// Masking is its own inverse, so this both masks and unmasks.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}
