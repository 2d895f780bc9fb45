// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One concrete `Authenticator`: an HMAC-SHA256 challenge/response, driven
//! by the initiator. The node sends an `AuthChallenge` frame carrying a
//! nonce; the initiator replies with an `AuthResponse` frame carrying its
//! name and `HMAC(key, nonce ‖ name)`; the node acks with `Ack` or closes
//! the connection.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    auth::{Authenticator, Credentials},
    error::AuthError,
    wire::{Frame, FrameCodec, MessageType},
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct HmacAuthenticator {
    credentials: Credentials,
}

impl HmacAuthenticator {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Authenticator for HmacAuthenticator {
    async fn authenticate(
        &self,
        reader: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, FrameCodec>,
        writer: &mut FramedWrite<tokio::net::tcp::OwnedWriteHalf, FrameCodec>,
    ) -> Result<(), AuthError> {
        let challenge = reader
            .next()
            .await
            .ok_or_else(|| AuthError::Io("connection closed before challenge".into()))?
            .map_err(|e| AuthError::Io(e.to_string()))?;

        if challenge.msg_type != MessageType::AuthChallenge {
            return Err(AuthError::MalformedChallenge(format!(
                "expected AuthChallenge, got {:?}",
                challenge.msg_type
            )));
        }
        let nonce = challenge.body;

        let mut mac = HmacSha256::new_from_slice(&self.credentials.key)
            .map_err(|e| AuthError::MalformedChallenge(e.to_string()))?;
        mac.update(&nonce);
        mac.update(self.credentials.name.as_bytes());
        let tag = mac.finalize().into_bytes();

        let name_bytes = self.credentials.name.as_bytes();
        let mut body = BytesMut::with_capacity(2 + name_bytes.len() + tag.len());
        body.put_u16(name_bytes.len() as u16);
        body.put_slice(name_bytes);
        body.put_slice(&tag);

        writer
            .send(Frame {
                msg_type: MessageType::AuthResponse,
                request_id: 0,
                body: body.freeze(),
            })
            .await
            .map_err(|e| AuthError::Io(e.to_string()))?;

        let reply = reader
            .next()
            .await
            .ok_or_else(|| AuthError::Io("connection closed before ack".into()))?
            .map_err(|e| AuthError::Io(e.to_string()))?;

        match reply.msg_type {
            MessageType::Ack => Ok(()),
            _ => Err(AuthError::Rejected),
        }
    }
}

/// Builds the nonce + tag verification a node-side implementation would run
/// (kept here, not behind the client-only `Authenticator` trait, purely to
/// give the in-process fake node used by the test suite something real to
/// check against instead of rubber-stamping every handshake).
pub fn verify(credentials: &Credentials, nonce: &Bytes, response_body: &Bytes) -> bool {
    let mut cursor = response_body.clone();
    if cursor.len() < 2 {
        return false;
    }
    let name_len = cursor.get_u16() as usize;
    if cursor.len() < name_len {
        return false;
    }
    let name = cursor.split_to(name_len);
    if name != credentials.name.as_bytes() {
        return false;
    }
    let tag = cursor;

    let Ok(mut mac) = HmacSha256::new_from_slice(&credentials.key) else {
        return false;
    };
    mac.update(nonce);
    mac.update(&name);
    mac.verify_slice(&tag).is_ok()
}
