//! Wire protocol codec
//!
//! The mount daemon speaks a small framed request/reply protocol over the
//! per-file socket. Requests carry a fixed 20-byte header followed by an
//! opcode-dependent payload; replies carry a fixed 16-byte header followed
//! by a reply-type-dependent payload. All header words are big-endian
//! unsigned 32-bit integers.
//!
//! # Request header
//!
//! ```text
//! [4 bytes: opcode][4: sequence number][4: arg1][4: arg2][4: payload length]
//! ```
//!
//! # Reply header
//!
//! ```text
//! [4 bytes: reply type][4: sequence number][4: arg1][4: arg2]
//! ```
//!
//! `error`, `closed` and `info` replies carry a payload whose length is in
//! `arg2`; `data-chunk` payload length is in `arg1`; the remaining reply
//! types carry no payload. The error payload is two NUL-terminated strings:
//! the error domain name, then the human-readable message.

use crate::error::StreamError;
use crate::Result;

/// Size of the fixed request header in bytes.
pub const REQUEST_HEADER_SIZE: usize = 20;

/// Size of the fixed reply header in bytes.
pub const REPLY_HEADER_SIZE: usize = 16;

/// Ceiling for a single read or write transfer. Larger counts are clamped;
/// the caller sees the short count and iterates.
pub const MAX_TRANSFER: usize = 4 * 1024 * 1024;

/// Ceiling accepted for the payload of an `error`, `closed` or `info`
/// reply. These payloads are buffered whole before decoding, so an insane
/// length from a broken peer is rejected instead of allocated.
pub const MAX_REPLY_PAYLOAD: usize = MAX_TRANSFER;

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    Read = 0,
    Write = 1,
    Close = 2,
    Cancel = 3,
    SeekSet = 4,
    SeekEnd = 5,
    QueryInfo = 6,
    Truncate = 7,
}

/// Reply types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReplyType {
    Data = 0,
    Error = 1,
    SeekPos = 2,
    Written = 3,
    Closed = 4,
    Info = 5,
    Truncated = 6,
}

impl ReplyType {
    fn from_wire(raw: u32) -> Option<ReplyType> {
        match raw {
            0 => Some(ReplyType::Data),
            1 => Some(ReplyType::Error),
            2 => Some(ReplyType::SeekPos),
            3 => Some(ReplyType::Written),
            4 => Some(ReplyType::Closed),
            5 => Some(ReplyType::Info),
            6 => Some(ReplyType::Truncated),
            _ => None,
        }
    }

    /// Number of payload bytes that follow a header of this type. Only
    /// `error`, `closed` and `info` replies carry a header-trailing payload;
    /// `data-chunk` payload is consumed separately in block phase.
    pub fn trailing_payload_len(self, arg2: u32) -> usize {
        match self {
            ReplyType::Error | ReplyType::Closed | ReplyType::Info => arg2 as usize,
            _ => 0,
        }
    }
}

/// Decoded reply header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub reply_type: ReplyType,
    pub seq: u32,
    pub arg1: u32,
    pub arg2: u32,
}

/// Encode a request header into its 20-byte wire form.
pub fn encode_request_header(
    opcode: Opcode,
    seq: u32,
    arg1: u32,
    arg2: u32,
    payload_len: u32,
) -> [u8; REQUEST_HEADER_SIZE] {
    let mut header = [0u8; REQUEST_HEADER_SIZE];
    header[0..4].copy_from_slice(&(opcode as u32).to_be_bytes());
    header[4..8].copy_from_slice(&seq.to_be_bytes());
    header[8..12].copy_from_slice(&arg1.to_be_bytes());
    header[12..16].copy_from_slice(&arg2.to_be_bytes());
    header[16..20].copy_from_slice(&payload_len.to_be_bytes());
    header
}

fn word(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Decode a 16-byte reply header.
///
/// An unknown reply type is a protocol error: without knowing whether the
/// reply carries a payload, the framing cannot be resynchronised.
pub fn decode_reply_header(buf: &[u8]) -> Result<ReplyHeader> {
    debug_assert!(buf.len() >= REPLY_HEADER_SIZE);

    let raw_type = word(buf, 0);
    let reply_type = ReplyType::from_wire(raw_type)
        .ok_or_else(|| StreamError::protocol(format!("unknown reply type {}", raw_type)))?;

    Ok(ReplyHeader {
        reply_type,
        seq: word(buf, 4),
        arg1: word(buf, 8),
        arg2: word(buf, 12),
    })
}

/// Number of bytes still missing before `buf` holds a complete reply,
/// header plus any header-trailing payload. Returns 0 when the reply is
/// complete and ready to decode.
pub fn reply_missing_bytes(buf: &[u8]) -> Result<usize> {
    if buf.len() < REPLY_HEADER_SIZE {
        return Ok(REPLY_HEADER_SIZE - buf.len());
    }

    let header = decode_reply_header(buf)?;
    let payload = header.reply_type.trailing_payload_len(header.arg2);
    if payload > MAX_REPLY_PAYLOAD {
        return Err(StreamError::protocol(format!(
            "reply payload too large: {} bytes",
            payload
        )));
    }

    Ok((REPLY_HEADER_SIZE + payload).saturating_sub(buf.len()))
}

/// Decode an error reply payload: two NUL-terminated strings, the error
/// domain name followed by the message.
pub fn decode_error_payload(payload: &[u8]) -> Result<(String, String)> {
    let malformed = || StreamError::protocol("malformed error reply payload");

    if payload.last() != Some(&0) {
        return Err(malformed());
    }

    let body = &payload[..payload.len() - 1];
    let split = body.iter().position(|&b| b == 0).ok_or_else(malformed)?;
    let (domain, message) = (&body[..split], &body[split + 1..]);
    if message.contains(&0) {
        return Err(malformed());
    }

    Ok((
        String::from_utf8_lossy(domain).into_owned(),
        String::from_utf8_lossy(message).into_owned(),
    ))
}
