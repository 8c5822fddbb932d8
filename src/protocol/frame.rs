//! Binary frame format (v2).
//!
//! A physical frame is laid out as
//!
//! ```text
//! [type u8][varint rid][varint ack][varint header length][TLV headers][u32 BE body length][body]
//! ```
//!
//! Each header is `[tag u8][varint length][value]`.  Unknown tags are
//! skipped so peers can add headers without breaking older readers.
//! The `ack` field is the highest sequence the sender has received
//! from us; the frame's own sequence, when it consumes credit, travels
//! in the `Seq` header.

use super::message::{Method, Permission, RequestId, StreamState};
use crate::error::FrameError;

const TAG_PATH: u8 = 0x01;
const TAG_QOS: u8 = 0x02;
const TAG_STATUS: u8 = 0x03;
const TAG_PERMIT: u8 = 0x04;
const TAG_SEQ: u8 = 0x05;
const TAG_TOTAL_LEN: u8 = 0x06;
const TAG_CONTINUATION: u8 = 0x07;

const MAX_HEADER_BLOCK: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Request(Method),
    Response,
    Ack,
    Ping,
    Unknown(u8),
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            MessageType::Request(Method::List) => 0x01,
            MessageType::Request(Method::Invoke) => 0x02,
            MessageType::Request(Method::Set) => 0x03,
            MessageType::Request(Method::Remove) => 0x04,
            MessageType::Request(Method::Subscribe) => 0x05,
            MessageType::Request(Method::Unsubscribe) => 0x06,
            MessageType::Request(Method::Close) => 0x07,
            MessageType::Response => 0x80,
            MessageType::Ack => 0xF0,
            MessageType::Ping => 0xF1,
            MessageType::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => MessageType::Request(Method::List),
            0x02 => MessageType::Request(Method::Invoke),
            0x03 => MessageType::Request(Method::Set),
            0x04 => MessageType::Request(Method::Remove),
            0x05 => MessageType::Request(Method::Subscribe),
            0x06 => MessageType::Request(Method::Unsubscribe),
            0x07 => MessageType::Request(Method::Close),
            0x80 => MessageType::Response,
            0xF0 => MessageType::Ack,
            0xF1 => MessageType::Ping,
            other => MessageType::Unknown(other),
        }
    }

    /// Whether frames of this type take a sequence number and
    /// therefore consume credit.  Pure acks never do, so they can
    /// always get through.
    pub fn consumes_credit(self) -> bool {
        !matches!(self, MessageType::Ack)
    }
}

/// Parsed header block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameHeaders {
    pub path: Option<String>,
    pub qos: Option<u8>,
    pub status: Option<StreamState>,
    pub permit: Option<Permission>,
    pub seq: Option<u32>,
    /// Declared size of the full logical body for multipart members.
    pub total_len: Option<u32>,
    pub continuation: bool,
}

/// One physical v2 frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub rid: RequestId,
    pub ack: u32,
    pub headers: FrameHeaders,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(message_type: MessageType, rid: RequestId) -> Self {
        Self {
            message_type,
            rid,
            ack: 0,
            headers: FrameHeaders::default(),
            body: Vec::new(),
        }
    }

    pub fn is_multipart(&self) -> bool {
        self.headers.continuation || self.headers.total_len.is_some()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut headers = Vec::new();
        if let Some(path) = &self.headers.path {
            put_tlv(&mut headers, TAG_PATH, path.as_bytes());
        }
        if let Some(qos) = self.headers.qos {
            put_tlv(&mut headers, TAG_QOS, &[qos]);
        }
        if let Some(status) = self.headers.status {
            let code = match status {
                StreamState::Open => 0u8,
                StreamState::Closed => 1u8,
            };
            put_tlv(&mut headers, TAG_STATUS, &[code]);
        }
        if let Some(permit) = self.headers.permit {
            put_tlv(&mut headers, TAG_PERMIT, &[permit.code()]);
        }
        if let Some(seq) = self.headers.seq {
            put_tlv(&mut headers, TAG_SEQ, &varint_bytes(seq as u64));
        }
        if let Some(total) = self.headers.total_len {
            put_tlv(&mut headers, TAG_TOTAL_LEN, &varint_bytes(total as u64));
        }
        if self.headers.continuation {
            put_tlv(&mut headers, TAG_CONTINUATION, &[]);
        }

        let mut out = Vec::with_capacity(16 + headers.len() + self.body.len());
        out.push(self.message_type.code());
        put_varint(&mut out, self.rid as u64);
        put_varint(&mut out, self.ack as u64);
        put_varint(&mut out, headers.len() as u64);
        out.extend_from_slice(&headers);
        out.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Decode one frame from the front of `buf`.  Returns the frame and
    /// the number of bytes it occupied, or `Ok(None)` if `buf` does not
    /// yet hold a whole frame.
    pub fn decode(buf: &[u8], max_body: usize) -> Result<Option<(Frame, usize)>, FrameError> {
        let mut cur = Cursor { buf, pos: 0 };
        let Some(code) = cur.byte() else {
            return Ok(None);
        };
        let Some(rid) = cur.varint()? else {
            return Ok(None);
        };
        let Some(ack) = cur.varint()? else {
            return Ok(None);
        };
        let Some(header_len) = cur.varint()? else {
            return Ok(None);
        };
        let header_len = header_len as usize;
        if header_len > MAX_HEADER_BLOCK {
            return Err(FrameError::TooLarge {
                size: header_len,
                limit: MAX_HEADER_BLOCK,
            });
        }
        let Some(header_block) = cur.take(header_len) else {
            return Ok(None);
        };
        let Some(len_bytes) = cur.take(4) else {
            return Ok(None);
        };
        let body_len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        if body_len > max_body {
            return Err(FrameError::TooLarge {
                size: body_len,
                limit: max_body,
            });
        }
        let Some(body) = cur.take(body_len) else {
            return Ok(None);
        };
        let consumed = cur.pos;

        let rid = u32::try_from(rid).map_err(|_| FrameError::Codec("rid out of range".into()))?;
        let ack = u32::try_from(ack).map_err(|_| FrameError::Codec("ack out of range".into()))?;
        let headers = parse_headers(header_block)?;
        Ok(Some((
            Frame {
                message_type: MessageType::from_code(code),
                rid,
                ack,
                headers,
                body: body.to_vec(),
            },
            consumed,
        )))
    }
}

fn parse_headers(block: &[u8]) -> Result<FrameHeaders, FrameError> {
    let mut headers = FrameHeaders::default();
    let mut cur = Cursor { buf: block, pos: 0 };
    while let Some(tag) = cur.byte() {
        let len = cur
            .varint()?
            .ok_or_else(|| FrameError::Codec("truncated header length".into()))? as usize;
        let value = cur
            .take(len)
            .ok_or_else(|| FrameError::Codec("truncated header value".into()))?;
        match tag {
            TAG_PATH => {
                let path = std::str::from_utf8(value)
                    .map_err(|_| FrameError::Codec("path header is not utf-8".into()))?;
                headers.path = Some(path.to_string());
            }
            TAG_QOS => headers.qos = value.first().copied(),
            TAG_STATUS => {
                headers.status = match value.first() {
                    Some(0) => Some(StreamState::Open),
                    Some(1) => Some(StreamState::Closed),
                    _ => return Err(FrameError::Codec("bad status header".into())),
                }
            }
            TAG_PERMIT => {
                headers.permit = value.first().copied().and_then(Permission::from_code);
            }
            TAG_SEQ => headers.seq = Some(varint_value(value)?),
            TAG_TOTAL_LEN => headers.total_len = Some(varint_value(value)?),
            TAG_CONTINUATION => headers.continuation = true,
            _ => {}
        }
    }
    Ok(headers)
}

fn varint_value(bytes: &[u8]) -> Result<u32, FrameError> {
    let mut cur = Cursor { buf: bytes, pos: 0 };
    let value = cur
        .varint()?
        .ok_or_else(|| FrameError::Codec("truncated varint header".into()))?;
    u32::try_from(value).map_err(|_| FrameError::Codec("varint header out of range".into()))
}

fn put_tlv(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    put_varint(out, value.len() as u64);
    out.extend_from_slice(value);
}

fn varint_bytes(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    put_varint(&mut out, value);
    out
}

/// LEB128 unsigned varint.
pub fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn byte(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    /// `Ok(None)` when the buffer ends mid-varint.
    fn varint(&mut self) -> Result<Option<u64>, FrameError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let Some(byte) = self.byte() else {
                return Ok(None);
            };
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(Some(value));
            }
        }
        Err(FrameError::Codec("varint too long".into()))
    }
}
