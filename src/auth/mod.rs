// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Authentication handshake and credentials file parsing. Out of scope per
//! spec.md §1 ("consumed via an Authenticator interface") — the core only
//! calls `Authenticator::authenticate` during `Connecting -> Authenticating
//! -> Connected`; this module provides the trait plus one concrete HMAC
//! implementation so the engine has something real to drive in tests.

mod credentials;
mod hmac_auth;

use async_trait::async_trait;
pub use credentials::{Credentials, KEY_LENGTH};
pub use hmac_auth::HmacAuthenticator;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    error::AuthError,
    wire::{Frame, FrameCodec},
};

/// Drives whatever challenge/response exchange sits between a raw TCP
/// connect and a connection becoming usable for requests. Implementations
/// read/write `Frame`s directly (message types other than `Request` are
/// reserved for this layer, per spec.md §3).
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        reader: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, FrameCodec>,
        writer: &mut FramedWrite<tokio::net::tcp::OwnedWriteHalf, FrameCodec>,
    ) -> Result<(), AuthError>;
}

/// No authentication: connections are usable as soon as the TCP handshake
/// completes. Useful for tests and for nodes that authenticate at a lower
/// layer (e.g. mutual TLS terminated before this crate sees the socket).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

#[async_trait]
impl Authenticator for NoAuth {
    async fn authenticate(
        &self,
        _reader: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, FrameCodec>,
        _writer: &mut FramedWrite<tokio::net::tcp::OwnedWriteHalf, FrameCodec>,
    ) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Re-exported so callers that only need the `Frame` type for a custom
/// `Authenticator` don't need a second `use`.
pub type AuthFrame = Frame;
