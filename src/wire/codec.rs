// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire frame: `body_len:u32 BE | msg_type:u8 | request_id:u64 BE | body`.
//!
//! `request_id` is carried as its own header field rather than as the first
//! eight bytes of `body` (the source implementation left this undocumented;
//! network byte order and a dedicated field are fixed here, see
//! `SPEC_FULL.md` §4.1 / §9).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Fixed header size: 4 (len) + 1 (type) + 8 (request id).
const HEADER_LEN: usize = 4 + 1 + 8;

/// A message type carried in the one-byte `msg_type` field. Only `Request`
/// is meaningful to the core; everything else is passed through untouched
/// to the authentication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    Ack,
    AuthChallenge,
    AuthResponse,
    Reserved(u8),
}

impl From<u8> for MessageType {
    fn from(b: u8) -> Self {
        match b {
            0 => MessageType::Request,
            1 => MessageType::Ack,
            2 => MessageType::AuthChallenge,
            3 => MessageType::AuthResponse,
            other => MessageType::Reserved(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> Self {
        match t {
            MessageType::Request => 0,
            MessageType::Ack => 1,
            MessageType::AuthChallenge => 2,
            MessageType::AuthResponse => 3,
            MessageType::Reserved(b) => b,
        }
    }
}

/// One fully assembled message.
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: MessageType,
    pub request_id: u64,
    pub body: Bytes,
}

impl Frame {
    pub fn request(request_id: u64, body: Bytes) -> Self {
        Self {
            msg_type: MessageType::Request,
            request_id,
            body,
        }
    }
}

/// Length-prefixed frame codec. `max_body_len` guards against a peer
/// claiming an absurd body length and exhausting memory before the rest of
/// the frame has even arrived.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_body_len: u32,
}

impl FrameCodec {
    pub fn new(max_body_len: u32) -> Self {
        Self { max_body_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        // 16 MiB is generous for a control-plane RPC transport; callers with
        // larger payloads should configure an explicit limit.
        Self::new(16 * 1024 * 1024)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body_len = u32::try_from(frame.body.len()).map_err(|_| {
            ProtocolError::MalformedFrame("body too large to encode".into())
        })?;
        dst.reserve(HEADER_LEN + frame.body.len());
        dst.put_u32(body_len);
        dst.put_u8(frame.msg_type.into());
        dst.put_u64(frame.request_id);
        dst.put_slice(&frame.body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Error = ProtocolError;
    type Item = Frame;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes(src[0..4].try_into().map_err(|_| {
            ProtocolError::MalformedFrame("short length prefix".into())
        })?);
        if body_len > self.max_body_len {
            return Err(ProtocolError::MalformedFrame(format!(
                "body_len {body_len} exceeds max {}",
                self.max_body_len
            )));
        }

        let total = HEADER_LEN + body_len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut header = src.split_to(HEADER_LEN);
        let _len = header.get_u32();
        let msg_type = MessageType::from(header.get_u8());
        let request_id = header.get_u64();

        let body = src.split_to(body_len as usize).freeze();

        Ok(Some(Frame {
            msg_type,
            request_id,
            body,
        }))
    }
}
