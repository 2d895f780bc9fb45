// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A tiny in-process "node": accepts one TCP connection and lets a test
//! script its replies directly in terms of `Frame`s, instead of mocking the
//! transport. Mirrors the shape of the teacher's own
//! `tests/integration_tests/common.rs`, minus the dependency on a real
//! external target.

use std::sync::Arc;

use multiplex_rpc::{
    auth::NoAuth,
    connection::{Connection, ConnectionConfig, ConnectionHandle, ConnState},
    wire::{Frame, FrameCodec},
};
use tokio::net::{
    TcpListener, TcpStream,
    tcp::{OwnedReadHalf, OwnedWriteHalf},
};
use tokio_util::codec::{FramedRead, FramedWrite};

pub struct FakeNode {
    pub addr: std::net::SocketAddr,
    listener: TcpListener,
}

impl FakeNode {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        Self { addr, listener }
    }

    /// Accepts the next inbound connection and splits it into framed
    /// halves ready for a test to drive directly.
    pub async fn accept(
        &self,
    ) -> (
        FramedRead<OwnedReadHalf, FrameCodec>,
        FramedWrite<OwnedWriteHalf, FrameCodec>,
    ) {
        let (stream, _) = self.listener.accept().await.expect("accept");
        split(stream)
    }
}

fn split(
    stream: TcpStream,
) -> (
    FramedRead<OwnedReadHalf, FrameCodec>,
    FramedWrite<OwnedWriteHalf, FrameCodec>,
) {
    let (r, w) = stream.into_split();
    (
        FramedRead::new(r, FrameCodec::default()),
        FramedWrite::new(w, FrameCodec::default()),
    )
}

/// Builds and starts a `Connection` (no auth) pointed at `addr`, returning
/// it once a caller awaits `wait_connected`.
pub fn dial(addr: std::net::SocketAddr) -> ConnectionHandle {
    let conn = Connection::new(ConnectionConfig::new(addr, Arc::new(NoAuth)));
    conn.start().expect("start");
    conn
}

pub async fn wait_connected(conn: &ConnectionHandle) {
    let mut status = conn.watch_status();
    if *status.borrow() == ConnState::Connected {
        return;
    }
    loop {
        status.changed().await.expect("connection watch closed");
        if *status.borrow() == ConnState::Connected {
            return;
        }
    }
}

/// Builds the `cmd.code ‖ cmd.ver ‖ body` request payload the all-nodes
/// initialiser and the single-node Echo examples both use.
pub fn echo_request_body(code: u16, version: u8, body: &[u8]) -> bytes::Bytes {
    let mut buf = bytes::BytesMut::with_capacity(3 + body.len());
    buf.extend_from_slice(&code.to_ne_bytes());
    buf.extend_from_slice(&[version]);
    buf.extend_from_slice(body);
    buf.freeze()
}

/// Status byte a node-side Echo handler prefixes a successful reply with.
pub const STATUS_OK: u8 = 0;

pub fn ok_reply(body: &[u8]) -> bytes::Bytes {
    let mut buf = bytes::BytesMut::with_capacity(1 + body.len());
    buf.extend_from_slice(&[STATUS_OK]);
    buf.extend_from_slice(body);
    buf.freeze()
}

/// Reads one `Frame` with a generous timeout so a hung test fails fast
/// instead of stalling the suite.
pub async fn recv_frame(
    reader: &mut FramedRead<OwnedReadHalf, FrameCodec>,
) -> Frame {
    tokio::time::timeout(std::time::Duration::from_secs(5), futures::StreamExt::next(reader))
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed")
        .expect("frame decode error")
}

pub async fn send_frame(
    writer: &mut FramedWrite<OwnedWriteHalf, FrameCodec>,
    frame: Frame,
) {
    futures::SinkExt::send(writer, frame).await.expect("send frame");
}
