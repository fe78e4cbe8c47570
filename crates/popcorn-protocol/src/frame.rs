//! Single-frame WebSocket codec (RFC 6455 subset).
//!
//! Only unfragmented frames are accepted. Supported opcodes are text,
//! close, ping and pong. Clients mask what they send; servers do not.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const FIN: u8 = 0x80;
const MASK: u8 = 0x80;

pub const OP_TEXT: u8 = 0x1;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xA;

/// Close status for a normal shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: Option<u16>, reason: String },
    Ping(Bytes),
    Pong(Bytes),
}

impl Frame {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close {
            code: Some(code),
            reason: reason.into(),
        }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Self::Text(_) => OP_TEXT,
            Self::Close { .. } => OP_CLOSE,
            Self::Ping(_) => OP_PING,
            Self::Pong(_) => OP_PONG,
        }
    }
}

/// Which end of the connection this codec serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

pub struct FrameCodec {
    role: Role,
    max_payload: usize,
    live: bool,
}

impl FrameCodec {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            max_payload: DEFAULT_MAX_PAYLOAD,
            live: true,
        }
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// False once a close frame has been sent.
    pub fn is_live(&self) -> bool {
        self.live
    }
}

fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, b) in payload.iter_mut().enumerate() {
        *b ^= key[i % 4];
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let (b0, b1) = (buf[0], buf[1]);
        if b0 & FIN == 0 {
            return Err(ProtocolError::Fragmented);
        }
        let opcode = b0 & 0x0F;
        if !matches!(opcode, OP_TEXT | OP_CLOSE | OP_PING | OP_PONG) {
            return Err(ProtocolError::UnsupportedOpcode(opcode));
        }
        let masked = b1 & MASK != 0;
        let (len_bytes, short_len) = match b1 & 0x7F {
            126 => (2, None),
            127 => (8, None),
            n => (0, Some(u64::from(n))),
        };
        let header_len = 2 + len_bytes + if masked { 4 } else { 0 };
        if buf.len() < header_len {
            buf.reserve(header_len - buf.len());
            return Ok(None);
        }
        let len = match short_len {
            Some(n) => n,
            None if len_bytes == 2 => u64::from(u16::from_be_bytes([buf[2], buf[3]])),
            None => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                u64::from_be_bytes(raw)
            }
        };
        let payload_len = match usize::try_from(len) {
            Ok(n) if n <= self.max_payload => n,
            _ => {
                return Err(ProtocolError::PayloadTooLarge {
                    len,
                    limit: self.max_payload,
                })
            }
        };
        if buf.len() < header_len + payload_len {
            buf.reserve(header_len + payload_len - buf.len());
            return Ok(None);
        }

        buf.advance(2 + len_bytes);
        let key = if masked {
            let mut key = [0u8; 4];
            buf.copy_to_slice(&mut key);
            Some(key)
        } else {
            None
        };
        let mut payload = buf.split_to(payload_len);
        if let Some(key) = key {
            apply_mask(&mut payload, key);
        }

        let frame = match opcode {
            OP_TEXT => Frame::Text(
                String::from_utf8(payload.to_vec())
                    .map_err(|_| ProtocolError::InvalidUtf8("text frame"))?,
            ),
            OP_CLOSE => match payload.len() {
                0 => Frame::Close {
                    code: None,
                    reason: String::new(),
                },
                1 => return Err(ProtocolError::BadClosePayload),
                _ => {
                    let code = payload.get_u16();
                    let reason = std::str::from_utf8(&payload)
                        .map_err(|_| ProtocolError::InvalidUtf8("close reason"))?
                        .to_string();
                    Frame::Close {
                        code: Some(code),
                        reason,
                    }
                }
            },
            OP_PING => Frame::Ping(payload.freeze()),
            _ => Frame::Pong(payload.freeze()),
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if !self.live {
            return Err(ProtocolError::ConnectionClosed);
        }
        let opcode = frame.opcode();
        let mut payload = BytesMut::new();
        match frame {
            Frame::Text(text) => payload.put_slice(text.as_bytes()),
            Frame::Close { code, reason } => {
                if let Some(code) = code {
                    payload.put_u16(code);
                    payload.put_slice(reason.as_bytes());
                }
                self.live = false;
            }
            Frame::Ping(data) | Frame::Pong(data) => payload.put_slice(&data),
        }

        let mask_bit = if self.role == Role::Client { MASK } else { 0 };
        dst.reserve(payload.len() + 14);
        dst.put_u8(FIN | opcode);
        match payload.len() {
            n if n < 126 => dst.put_u8(mask_bit | n as u8),
            n if n <= usize::from(u16::MAX) => {
                dst.put_u8(mask_bit | 126);
                dst.put_u16(n as u16);
            }
            n => {
                dst.put_u8(mask_bit | 127);
                dst.put_u64(n as u64);
            }
        }
        if self.role == Role::Client {
            let key: [u8; 4] = rand::random();
            dst.put_slice(&key);
            apply_mask(&mut payload, key);
        }
        dst.put_slice(&payload);
        Ok(())
    }
}
