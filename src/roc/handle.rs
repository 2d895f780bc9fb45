// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `RequestHandle`: the `EventDispatcher` surface a handler coroutine is
//! given to drive its own suspend/resume cycle (SPEC_FULL.md §4.5).

use bitflags::bitflags;
use bytes::Bytes;
use zerocopy::FromBytes;

use crate::{
    connection::{ConnectionHandle, engine::RocWake},
    error::{ConnError, RocError},
    request_set::{RequestId, RequestRecord},
    roc::Payload,
};

/// Links a `RequestHandle` back to its `RequestRecord` slot, so a
/// controller can later resume this specific request-on-connection with an
/// out-of-band code (SPEC_FULL.md §4.7).
#[derive(Clone)]
struct ControllerLink {
    record: std::sync::Arc<RequestRecord>,
    slot: u64,
}

bitflags! {
    /// What a call to `next_event` is willing to be resumed by. `RECEIVE`
    /// and `YIELD` are mutually exclusive in this implementation: a yield is
    /// a pure scheduling checkpoint and never waits on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u8 {
        const RECEIVE = 0b0000_0001;
        const YIELD   = 0b0000_0010;
    }
}

/// What a suspended request-on-connection woke up with.
#[derive(Debug, Clone)]
pub enum RocEvent {
    /// The queued send for this request was written to the socket.
    Sent,
    /// A reply addressed to this request arrived.
    Received(Bytes),
    /// The request yielded and a scheduler pass came back around to it.
    ResumedYielded,
    /// Resumed by an out-of-band controller code (SPEC_FULL.md §4.7).
    ResumedWithCode(i64),
}

/// One request's view of its connection: the only way handler code talks to
/// the engine. Cloning a handle is cheap (it's just an id plus an `Arc`).
#[derive(Clone)]
pub struct RequestHandle {
    pub request_id: RequestId,
    pub conn: ConnectionHandle,
    controller: Option<ControllerLink>,
}

impl RequestHandle {
    pub fn new(request_id: RequestId, conn: ConnectionHandle) -> Self {
        Self {
            request_id,
            conn,
            controller: None,
        }
    }

    /// Attaches the request-on-connection slot a controller can target for
    /// out-of-band resumes. Set once, by `RequestSet`, before the handler
    /// task starts.
    pub(crate) fn with_controller(
        mut self,
        record: std::sync::Arc<RequestRecord>,
        slot: u64,
    ) -> Self {
        self.controller = Some(ControllerLink { record, slot });
        self
    }

    /// Sends `fill`'s payload, if given, then suspends until one of the
    /// conditions named in `flags` resumes this request.
    ///
    /// `EventFlags::YIELD` is handled specially: since this engine runs each
    /// request as a real tokio task rather than a cooperative fiber stepped
    /// by a single-threaded scheduler, a "yield" is realized as
    /// `tokio::task::yield_now` rather than a round trip through the
    /// connection's waker table (see DESIGN.md). It always resumes
    /// immediately with `ResumedYielded` and ignores any other flag set
    /// alongside it.
    pub async fn next_event(
        &self,
        flags: EventFlags,
        send: Option<Payload>,
    ) -> Result<RocEvent, RocError> {
        if flags.contains(EventFlags::YIELD) {
            tokio::task::yield_now().await;
            return Ok(RocEvent::ResumedYielded);
        }

        let mut awaiting_sent = send.is_some();
        let asked_receive = flags.contains(EventFlags::RECEIVE);

        if let Some(payload) = send {
            self.conn
                .register_for_sending(self.request_id, payload.into_bytes())
                .map_err(RocError::Conn)?;
        }
        if asked_receive {
            self.conn
                .register_for_error_notification(self.request_id)
                .map_err(RocError::Conn)?;
        }

        if !awaiting_sent && !asked_receive {
            return Err(RocError::Protocol(
                "next_event called with nothing to wait for".into(),
            ));
        }

        // The write and the reply are two separate wake-ups on a real
        // connection (the sender task drains its queue asynchronously), so
        // when both a send and a receive were requested, `Sent` is an
        // intermediate event: consume it and keep waiting for `Received`
        // rather than returning early.
        loop {
            let (generation, rx) = self.conn.register_wake(self.request_id);
            if let Some(link) = &self.controller {
                link.record.set_generation(link.slot, generation);
            }
            let wake = match rx.await {
                Ok(w) => w,
                Err(_) => {
                    self.conn.cancel_wake(self.request_id, generation);
                    if let Some(link) = &self.controller {
                        link.record.clear_generation(link.slot);
                    }
                    return Err(RocError::Conn(ConnError::Closed));
                },
            };
            if let Some(link) = &self.controller {
                link.record.clear_generation(link.slot);
            }

            match wake {
                RocWake::Sent if awaiting_sent => {
                    if !asked_receive {
                        return Ok(RocEvent::Sent);
                    }
                    awaiting_sent = false;
                },
                RocWake::Received(body) if asked_receive => return Ok(RocEvent::Received(body)),
                RocWake::ResumedYielded => return Ok(RocEvent::ResumedYielded),
                RocWake::Code(code) => return Ok(RocEvent::ResumedWithCode(code)),
                RocWake::Shutdown(cause) => return Err(RocError::Conn(cause)),
                other => {
                    return Err(RocError::Protocol(format!(
                        "resumed with {other:?} but flags were {flags:?}"
                    )));
                },
            }
        }
    }

    /// Convenience wrapper: send `payload` and wait only for the write to
    /// complete (no reply expected).
    pub async fn send(&self, payload: Payload) -> Result<(), RocError> {
        match self.next_event(EventFlags::empty(), Some(payload)).await? {
            RocEvent::Sent => Ok(()),
            other => Err(RocError::Protocol(format!("expected Sent, got {other:?}"))),
        }
    }

    /// Convenience wrapper: wait for exactly one reply.
    pub async fn receive(&self) -> Result<Bytes, RocError> {
        match self.next_event(EventFlags::RECEIVE, None).await? {
            RocEvent::Received(body) => Ok(body),
            other => Err(RocError::Protocol(format!(
                "expected Received, got {other:?}"
            ))),
        }
    }

    /// Sends `payload` and waits for the one reply addressed to this
    /// request.
    pub async fn send_and_receive(&self, payload: Payload) -> Result<Bytes, RocError> {
        match self
            .next_event(EventFlags::RECEIVE, Some(payload))
            .await?
        {
            RocEvent::Received(body) => Ok(body),
            other => Err(RocError::Protocol(format!(
                "expected Received, got {other:?}"
            ))),
        }
    }

    /// Cooperatively yields this request's turn back to the scheduler.
    pub async fn yield_now(&self) {
        let _ = self.next_event(EventFlags::YIELD, None).await;
    }

    /// Waits for a single message whose body is exactly one POD value of
    /// type `T`, decoded in place with no extra copy.
    pub async fn receive_value<T: FromBytes + Copy>(&self) -> Result<T, RocError> {
        let body = self.receive().await?;
        T::read_from_bytes(&body).map_err(|_| {
            RocError::Protocol(format!(
                "expected a {}-byte value, got {} bytes",
                std::mem::size_of::<T>(),
                body.len()
            ))
        })
    }
}
