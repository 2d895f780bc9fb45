// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error types shared by the connection engine, the request-on-connection
//! engine and the request set.

use std::{io, sync::Arc};

use thiserror::Error;

use crate::request_set::RequestId;

/// Malformed or unexpected wire traffic. Always fatal to the connection that
/// produced it.
#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),
    #[error("unexpected reply for request {request_id}")]
    UnexpectedReply { request_id: RequestId },
    #[error("status byte out of range: {0}")]
    StatusOutOfRange(u8),
    #[error("unsolicited message for request {request_id}")]
    UnsolicitedMessage { request_id: RequestId },
    #[error("{0}")]
    Other(String),
}

/// Authentication handshake failure. Treated as a protocol error: never
/// automatically retried by the sender task.
#[derive(Debug, Error, Clone)]
pub enum AuthError {
    #[error("credentials rejected by peer")]
    Rejected,
    #[error("malformed challenge: {0}")]
    MalformedChallenge(String),
    #[error("io error during handshake: {0}")]
    Io(String),
}

/// Top-level error carried by `Connection::shutdown` and delivered to every
/// request-on-connection registered on the connection at the time of
/// shutdown.
#[derive(Debug, Error, Clone)]
pub enum ConnError {
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("connection closed")]
    Closed,
    #[error("connection stopped by caller")]
    StoppedByCaller,
}

impl From<io::Error> for ConnError {
    fn from(e: io::Error) -> Self {
        ConnError::Io(Arc::new(e))
    }
}

/// Errors returned synchronously from `RequestSet::start_*`/`assign`, never
/// reaching the connection engine.
#[derive(Debug, Error, Clone)]
pub enum RequestSetError {
    #[error("request set is full (max_requests reached)")]
    NoMoreRequests,
    #[error("no nodes registered")]
    NoNodesRegistered,
    #[error("invalid channel name: {0}")]
    BadChannelName(String),
    #[error("this request kind does not support a timeout")]
    TimeoutUnsupported,
    #[error("unknown request id {0}")]
    UnknownRequest(RequestId),
}

/// Errors surfaced to a handler from `RequestHandle::next_event` and its
/// wrappers.
#[derive(Debug, Error, Clone)]
pub enum RocError {
    #[error(transparent)]
    Conn(#[from] ConnError),
    #[error("protocol violation: {0}")]
    Protocol(String),
}
