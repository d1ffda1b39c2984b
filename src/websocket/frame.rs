//! WebSocket frame codec.
//!
//! # Responsibilities
//! - Decode one frame from a byte slice (FIN, opcode, mask, 7/16/64-bit length)
//! - Unmask client-to-server payloads
//! - Encode unfragmented, unmasked server frames
//! - Build and parse close payloads
//!
//! # Design Decisions
//! - Truncated input is `InsufficientData`, never a protocol violation, so a
//!   caller can buffer more bytes and retry
//! - Reserved bits are rejected: no extensions are ever negotiated
//! - The encoder always emits the minimal length encoding

use thiserror::Error;

/// Largest payload length that fits in the 7-bit length field.
const MAX_SHORT_LEN: usize = 125;
/// Largest payload length that fits in the 16-bit extended field.
const MAX_MEDIUM_LEN: usize = 65_535;

/// Frame opcodes.
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
    /// Control frames are close, ping and pong.
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

/// Well-known close status codes.
pub struct CloseCode;

impl CloseCode {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// Reported locally when a close frame carries no status.
    pub const NO_STATUS: u16 = 1005;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Errors produced while decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The buffer ends before the frame does.
    #[error("insufficient data: need {needed} bytes, have {available}")]
    InsufficientData { needed: usize, available: usize },

    /// RSV1, RSV2 or RSV3 is set.
    #[error("protocol violation: reserved bits set (0x{0:x})")]
    ReservedBits(u8),

    /// Opcode outside the defined set.
    #[error("protocol violation: unknown opcode 0x{0:x}")]
    UnknownOpcode(u8),

    /// The most significant bit of a 64-bit length is set.
    #[error("protocol violation: 64-bit payload length has its high bit set")]
    InvalidLength,
}

impl FrameError {
    /// True for malformed frames, false for frames that are merely incomplete.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, FrameError::InsufficientData { .. })
    }
}

/// One decoded WebSocket frame.
///
/// Reserved bits are not stored: a decoded frame always has them clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    /// Present when the MASK bit was set on the wire.
    pub mask_key: Option<[u8; 4]>,
    /// Payload bytes, already unmasked.
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_masked(&self) -> bool {
        self.mask_key.is_some()
    }

    /// Payload interpreted as UTF-8, for text frames.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Fixed-size part of a frame: everything before the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask_key: Option<[u8; 4]>,
    /// Declared payload length.
    pub payload_len: u64,
    /// Bytes taken by the header, including extended length and mask key.
    pub header_len: usize,
}

fn take<'a>(data: &'a [u8], offset: usize, len: usize) -> Result<&'a [u8], FrameError> {
    let end = offset + len;
    data.get(offset..end).ok_or(FrameError::InsufficientData {
        needed: end,
        available: data.len(),
    })
}

/// Parse the frame header at the start of `data`.
pub fn decode_header(data: &[u8]) -> Result<FrameHeader, FrameError> {
    let head = take(data, 0, 2)?;

    let fin = head[0] & 0x80 != 0;
    let rsv = head[0] & 0x70;
    if rsv != 0 {
        return Err(FrameError::ReservedBits(rsv >> 4));
    }
    let opcode = Opcode::try_from(head[0] & 0x0F)?;

    let masked = head[1] & 0x80 != 0;
    let mut offset = 2;
    let payload_len = match head[1] & 0x7F {
        126 => {
            let ext = take(data, offset, 2)?;
            offset += 2;
            u64::from(u16::from_be_bytes([ext[0], ext[1]]))
        }
        127 => {
            let ext = take(data, offset, 8)?;
            offset += 8;
            let mut be = [0u8; 8];
            be.copy_from_slice(ext);
            let len = u64::from_be_bytes(be);
            if len >> 63 != 0 {
                return Err(FrameError::InvalidLength);
            }
            len
        }
        short => u64::from(short),
    };

    let mask_key = if masked {
        let key = take(data, offset, 4)?;
        offset += 4;
        Some([key[0], key[1], key[2], key[3]])
    } else {
        None
    };

    Ok(FrameHeader {
        fin,
        opcode,
        mask_key,
        payload_len,
        header_len: offset,
    })
}

/// Decode one frame from the start of `data`.
///
/// Returns the frame and the number of bytes it occupied; trailing bytes
/// belong to whatever comes next.
pub fn decode_prefix(data: &[u8]) -> Result<(Frame, usize), FrameError> {
    let header = decode_header(data)?;

    let payload_len = usize::try_from(header.payload_len).map_err(|_| {
        FrameError::InsufficientData {
            needed: usize::MAX,
            available: data.len(),
        }
    })?;
    let needed = header
        .header_len
        .checked_add(payload_len)
        .ok_or(FrameError::InsufficientData {
            needed: usize::MAX,
            available: data.len(),
        })?;

    let mut payload = take(data, header.header_len, payload_len)?.to_vec();
    if let Some(key) = header.mask_key {
        apply_mask(&mut payload, &key);
    }

    Ok((
        Frame {
            fin: header.fin,
            opcode: header.opcode,
            mask_key: header.mask_key,
            payload,
        },
        needed,
    ))
}

/// Decode one frame from `data`, ignoring any trailing bytes.
pub fn decode(data: &[u8]) -> Result<Frame, FrameError> {
    decode_prefix(data).map(|(frame, _)| frame)
}

/// XOR `payload` with `key` cycled by byte position. Applying it twice is a no-op.
pub fn apply_mask(payload: &mut [u8], key: &[u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encode a final, unmasked frame.
pub fn encode(payload: &[u8], opcode: Opcode) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(10 + len);
    out.push(0x80 | opcode as u8);

    if len <= MAX_SHORT_LEN {
        out.push(len as u8);
    } else if len <= MAX_MEDIUM_LEN {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    out.extend_from_slice(payload);
    out
}

/// Build a close payload: big-endian status code followed by the reason.
pub fn close_payload(code: u16, reason: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason);
    payload
}

/// Split a close payload into status code and reason.
///
/// An empty payload reports [`CloseCode::NO_STATUS`].
pub fn parse_close_payload(payload: &[u8]) -> (u16, &[u8]) {
    if payload.len() >= 2 {
        (u16::from_be_bytes([payload[0], payload[1]]), &payload[2..])
    } else {
        (CloseCode::NO_STATUS, &[])
    }
}
