//! WebSocket frame codec (RFC 6455 Section 5.2-5.3).
//!
//! Frames are the smallest unit of WebSocket communication. The codec is a
//! set of pure functions over byte buffers; buffering partial input across
//! stream reads is the caller's job (see [`Connection`](crate::Connection)).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! - [`decode`]: Parse one frame from the front of a buffer (handles unmasking)
//! - [`decode_header`]: Parse only the header, to vet the declared length early
//! - [`encode`]: Build an unmasked (server) frame
//! - [`encode_masked`]: Build a masked (client) frame
//! - [`apply_mask`]: Symmetric XOR masking per RFC 6455 Section 5.3

use std::io::{self, Write};

use crate::error::ProtocolError;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

/// WebSocket frame opcodes per RFC 6455 Section 5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Parse a 4-bit opcode value. Reserved values (0x3-0x7, 0xB-0xF) are rejected.
    pub fn from_u8(byte: u8) -> Result<Opcode, ProtocolError> {
        match byte {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            _ => Err(ProtocolError::InvalidOpcode(byte)),
        }
    }

    /// Close, Ping and Pong.
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }

    /// Continuation, Text and Binary.
    pub fn is_data(self) -> bool {
        !self.is_control()
    }
}

/// A decoded WebSocket frame. The payload is always stored unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// FIN bit -- `true` if this is the final fragment of a message.
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    /// Whether the frame arrived masked.
    pub masked: bool,
    /// The masking key, present only when `masked` is set.
    pub mask_key: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// An unmasked frame with the RSV bits clear.
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>, fin: bool) -> Frame {
        Frame {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            masked: false,
            mask_key: None,
            payload: payload.into(),
        }
    }

    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// The fixed part of a frame, parsed without touching the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask_key: Option<[u8; 4]>,
    /// Declared payload length.
    pub payload_len: u64,
    /// Bytes occupied by the header, including extended length and masking key.
    pub header_len: usize,
}

/// Apply or remove the 4-byte XOR mask on a payload.
///
/// The operation is symmetric: applying the mask twice returns the original.
pub fn apply_mask(payload: &mut [u8], mask_key: &[u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Parse a frame header from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. Header-level violations
/// (RSV bits, unknown opcode, bad control frames, reserved length bit) are
/// reported as soon as the offending byte is available.
pub fn decode_header(buf: &[u8]) -> Result<Option<FrameHeader>, ProtocolError> {
    // Byte 0: FIN(1) RSV(3) Opcode(4)
    let Some(&byte0) = buf.first() else {
        return Ok(None);
    };
    if byte0 & 0x70 != 0 {
        return Err(ProtocolError::ReservedBitsSet);
    }
    let fin = byte0 & 0x80 != 0;
    let opcode = Opcode::from_u8(byte0 & 0x0F)?;
    if opcode.is_control() && !fin {
        return Err(ProtocolError::FragmentedControlFrame);
    }

    // Byte 1: MASK(1) Payload-Length(7)
    let Some(&byte1) = buf.get(1) else {
        return Ok(None);
    };
    let masked = byte1 & 0x80 != 0;
    let length_byte = byte1 & 0x7F;
    if opcode.is_control() && u64::from(length_byte) > MAX_CONTROL_PAYLOAD {
        return Err(ProtocolError::ControlFrameTooLarge(u64::from(length_byte)));
    }

    let mut offset = 2;
    let payload_len = match length_byte {
        126 => {
            let Some(ext) = buf.get(offset..offset + 2) else {
                return Ok(None);
            };
            offset += 2;
            u64::from(u16::from_be_bytes([ext[0], ext[1]]))
        }
        127 => {
            let Some(ext) = buf.get(offset..offset + 8) else {
                return Ok(None);
            };
            offset += 8;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(ext);
            let len = u64::from_be_bytes(bytes);
            if len >> 63 != 0 {
                return Err(ProtocolError::InvalidLength);
            }
            len
        }
        n => u64::from(n),
    };

    let mask_key = if masked {
        let Some(key) = buf.get(offset..offset + 4) else {
            return Ok(None);
        };
        offset += 4;
        Some([key[0], key[1], key[2], key[3]])
    } else {
        None
    };

    Ok(Some(FrameHeader {
        fin,
        opcode,
        mask_key,
        payload_len,
        header_len: offset,
    }))
}

/// Decode one frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it occupied, so the caller can
/// drop them and resume from the residual buffer. `Ok(None)` means the
/// buffer holds only part of a frame.
pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    let Some(header) = decode_header(buf)? else {
        return Ok(None);
    };

    let available = (buf.len() - header.header_len) as u64;
    if available < header.payload_len {
        return Ok(None);
    }
    // Fits in usize: bounded by buf.len()
    let end = header.header_len + header.payload_len as usize;
    let mut payload = buf[header.header_len..end].to_vec();
    if let Some(key) = header.mask_key {
        apply_mask(&mut payload, &key);
    }

    let frame = Frame {
        fin: header.fin,
        rsv1: false,
        rsv2: false,
        rsv3: false,
        opcode: header.opcode,
        masked: header.mask_key.is_some(),
        mask_key: header.mask_key,
        payload,
    };
    Ok(Some((frame, end)))
}

/// Append the first two header bytes plus extended length for `len`.
fn push_header(out: &mut Vec<u8>, opcode: Opcode, fin: bool, masked: bool, len: usize) {
    let byte0 = if fin { 0x80 } else { 0x00 } | opcode as u8;
    let mask_bit = if masked { 0x80 } else { 0x00 };
    out.push(byte0);
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= 65535 {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

/// Encode an unmasked frame (server-to-client).
///
/// Server frames MUST NOT be masked per RFC 6455 Section 5.1, so the mask
/// bit in byte 1 is always clear.
pub fn encode(payload: &[u8], opcode: Opcode, fin: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + payload.len());
    push_header(&mut out, opcode, fin, false, payload.len());
    out.extend_from_slice(payload);
    out
}

/// Encode a masked frame (client-to-server) with the given masking key.
pub fn encode_masked(payload: &[u8], opcode: Opcode, fin: bool, mask_key: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(14 + payload.len());
    push_header(&mut out, opcode, fin, true, payload.len());
    out.extend_from_slice(&mask_key);
    let start = out.len();
    out.extend_from_slice(payload);
    apply_mask(&mut out[start..], &mask_key);
    out
}

/// Write one unmasked frame to the stream and flush it.
pub fn write_frame<W: Write>(
    writer: &mut W,
    opcode: Opcode,
    payload: &[u8],
    fin: bool,
) -> io::Result<()> {
    writer.write_all(&encode(payload, opcode, fin))?;
    writer.flush()
}
