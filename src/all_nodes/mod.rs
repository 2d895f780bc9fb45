// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The all-nodes request kit: the reusable connect → initialise → handle
//! state machine every long-running all-nodes request is built on
//! (SPEC_FULL.md §4.9), plus its suspendable variant.
//!
//! Unlike spec.md's source, which dedicates a second cooperative fiber to
//! the suspend/resume/stop control protocol, this realization drives it
//! from the *same* suspend point the handler already uses: a
//! `RequestHandle` has exactly one wake slot per request id, and a
//! controller's `resume_with_code` already resumes whatever that slot is
//! waiting on with `RocEvent::ResumedWithCode` — including a receive wait.
//! So a pending state change simply interrupts the handler's next receive
//! instead of racing it from an independent task. See DESIGN.md for why a
//! literal second fiber isn't representable without a second demux key on
//! the wire.

mod initialiser;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};

pub use initialiser::{InitOutcome, Initialiser, SuspendableInitialiser, UnsupportedKind};

use crate::{
    connection::ConnState,
    controller::{DesiredState, SIGNAL_STATE_CHANGE_REQUESTED, SuspendableShared},
    error::RocError,
    roc::{EventFlags, RequestHandle, RocEvent},
};

/// Request-scoped counters shared by every request-on-connection of one
/// all-nodes request (SPEC_FULL.md §4.9's `SharedWorking`). `on_started`
/// fires the request's `started` notification exactly once, the moment
/// every request-on-connection that was initialising when the request came
/// up has finished (SPEC_FULL.md §4.9, spec.md §8 property 6).
pub struct SharedWorking {
    initialising: std::sync::atomic::AtomicUsize,
    called_started: std::sync::atomic::AtomicBool,
    on_started: Box<dyn Fn() + Send + Sync>,
}

impl Default for SharedWorking {
    fn default() -> Self {
        Self::with_on_started(|| {})
    }
}

impl SharedWorking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_on_started(on_started: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            initialising: std::sync::atomic::AtomicUsize::new(0),
            called_started: std::sync::atomic::AtomicBool::new(false),
            on_started: Box::new(on_started),
        }
    }

    fn enter_initialising(&self) {
        self.initialising
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    /// Returns `true` exactly once, the first time `initialising` drops back
    /// to zero after having been incremented — the moment every currently
    /// initialising request-on-connection has finished, which is when
    /// `all_initialised` should fire its `started` notification.
    fn exit_initialising_and_check_all_done(&self) -> bool {
        let remaining = self
            .initialising
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst)
            - 1;
        remaining == 0
            && self
                .called_started
                .compare_exchange(
                    false,
                    true,
                    std::sync::atomic::Ordering::SeqCst,
                    std::sync::atomic::Ordering::SeqCst,
                )
                .is_ok()
    }

    /// Invokes `on_started`. The caller is responsible for only calling this
    /// once `exit_initialising_and_check_all_done` has returned `true`.
    pub(crate) fn fire_started(&self) {
        (self.on_started)();
    }
}

/// Waits until `handle`'s connection is `Connected`, or returns `false` if
/// the connection has been permanently stopped first (SPEC_FULL.md §4.9's
/// `Connector()`).
pub async fn wait_connected(handle: &RequestHandle) -> bool {
    let mut rx = handle.conn.watch_status();
    if *rx.borrow() == ConnState::Connected {
        return true;
    }
    loop {
        tokio::select! {
            () = handle.conn.wait_stopped() => return false,
            changed = rx.changed() => {
                if changed.is_err() {
                    return false;
                }
                if *rx.borrow() == ConnState::Connected {
                    return true;
                }
            }
        }
    }
}

/// Request-specific behaviour the kit drives. `on_message` processes one
/// already-assembled reply; it must not itself suspend (no further protocol
/// exchange happens inside it) — a handler needing a multi-step exchange
/// beyond the initial setup should drive it directly with `RequestHandle`
/// rather than through this kit.
#[async_trait]
pub trait AllNodesHandler: Send + Sync {
    async fn on_message(&self, body: Bytes) -> Result<bool, RocError>;
}

/// Drives the per-message loop described in SPEC_FULL.md §4.9's `Handler()`,
/// transparently servicing suspend/resume/stop signals as they interrupt the
/// handler's receive wait. Returns once the handler signals completion,
/// the connection breaks, or (for a suspendable request) `Stop` is acked.
pub async fn drive_handler(
    handle: &RequestHandle,
    handler: &dyn AllNodesHandler,
    suspendable: Option<&SuspendableShared>,
) -> Result<(), RocError> {
    loop {
        match handle.next_event(EventFlags::RECEIVE, None).await? {
            RocEvent::Received(body) => {
                if !handler.on_message(body).await? {
                    return Ok(());
                }
            },
            RocEvent::ResumedWithCode(code) if code == SIGNAL_STATE_CHANGE_REQUESTED => {
                let Some(shared) = suspendable else {
                    trace!("state-change signal on a non-suspendable request, ignoring");
                    continue;
                };
                run_control_exchange(handle, shared).await?;
                if shared.desired_state() == DesiredState::Stopped {
                    return Ok(());
                }
            },
            other => {
                return Err(RocError::Protocol(format!(
                    "unexpected {other:?} while driving an all-nodes handler"
                )));
            },
        }
    }
}

/// Sends the control message matching `shared`'s current `desired_state`,
/// awaits the node's `Ack`, and fires the user notification once every
/// request-on-connection currently mid-change has acked (SPEC_FULL.md §4.7
/// steps 2-4). Loops if `desired_state` changed again while this exchange
/// was in flight (the user may call the controller again from inside the
/// notification callback).
async fn run_control_exchange(
    handle: &RequestHandle,
    shared: &SuspendableShared,
) -> Result<(), RocError> {
    loop {
        let desired = shared.desired_state();
        let msg: crate::controller::ControlMessage = desired.into();
        shared.begin_sending();

        let mut payload = crate::roc::Payload::new();
        payload.add(&(msg as u8));
        let reply = handle.send_and_receive(payload).await?;

        let acked = reply
            .first()
            .copied()
            .and_then(|b| crate::controller::ControlMessage::try_from(b).ok());
        if acked != Some(crate::controller::ControlMessage::Ack) {
            return Err(RocError::Protocol(format!(
                "expected Ack for a {msg:?} control message, got {reply:?}"
            )));
        }

        if shared.ack_received() == 0 {
            shared.fire_notification(desired);
        }

        if shared.desired_state() == desired {
            return Ok(());
        }
        debug!("desired state changed again mid-exchange, re-sending");
    }
}

/// Drives the outer connect → initialise → handle loop for one
/// request-on-connection of a (possibly suspendable) all-nodes request.
/// `on_disconnected` is called once per reconnect cycle (SPEC_FULL.md §4.9's
/// `Disconnected(e)` notification); the loop always retries unless the
/// connection is permanently stopped or the request aborts during
/// initialisation. `on_unsupported` is called once, with the node's address,
/// if the node answers initialisation with a global "not supported" status
/// (SPEC_FULL.md §7's `RequestEvent::Unsupported`, spec.md §8 property 7).
pub async fn run<I, H>(
    handle: RequestHandle,
    working: &SharedWorking,
    mut make_initialiser: impl FnMut() -> I,
    handler: H,
    suspendable: Option<&SuspendableShared>,
    mut on_disconnected: impl FnMut(RocError),
    mut on_unsupported: impl FnMut(UnsupportedKind, std::net::SocketAddr),
) where
    I: InitialiserLike,
    H: AllNodesHandler,
{
    loop {
        if !wait_connected(&handle).await {
            return;
        }

        let initialiser = make_initialiser();
        let outcome = match initialiser.initialise(&handle, working).await {
            Ok(o) => o,
            Err(e) => {
                on_disconnected(e);
                continue;
            },
        };

        let result = match outcome {
            InitOutcome::Aborted => return,
            InitOutcome::Unsupported(kind) => {
                on_unsupported(kind, handle.conn.addr());
                return;
            },
            InitOutcome::Ready => drive_handler(&handle, &handler, suspendable).await,
        };

        initialiser.reset(&outcome);

        match result {
            Ok(()) => return,
            Err(e) => on_disconnected(e),
        }
    }
}

/// Object-safe seam between `run`'s generic driver and the two concrete
/// initialisers (`Initialiser`, `SuspendableInitialiser`).
#[async_trait]
pub trait InitialiserLike {
    async fn initialise(
        &self,
        handle: &RequestHandle,
        working: &SharedWorking,
    ) -> Result<InitOutcome, RocError>;

    fn reset(&self, outcome: &InitOutcome);
}
