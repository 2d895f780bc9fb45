// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The standard and suspendable `Initialiser`s (SPEC_FULL.md §4.9): the
//! fixed prelude every all-nodes request runs before its handler loop —
//! send `(cmd.code, cmd.ver, fill)`, read the one-byte status, and hand
//! off to the request or abort on a global status code.

use async_trait::async_trait;

use crate::{
    all_nodes::{InitialiserLike, SharedWorking},
    controller::{DesiredState, SuspendableShared},
    error::RocError,
    roc::{Payload, RequestHandle},
};

/// Global status codes validated before any request-specific status
/// dispatch (spec.md §4.9). The source leaves the exact byte values
/// unspecified; fixed here as the top of the status byte's range so a
/// request's own status codes stay in `0..=253`.
pub const STATUS_REQUEST_NOT_SUPPORTED: u8 = 254;
pub const STATUS_REQUEST_VERSION_NOT_SUPPORTED: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedKind {
    RequestNotSupported,
    RequestVersionNotSupported,
}

/// What an `Initialiser` run produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// The node accepted the request; `drive_handler` should run with the
    /// request-specific status byte consumed.
    Ready,
    /// A global status code rejected the request outright.
    Unsupported(UnsupportedKind),
    /// Initialisation was skipped (suspendable request already stopped).
    Aborted,
}

/// Builds the initial payload for one request-on-connection:
/// `cmd.code ‖ cmd.ver ‖ fill(..)`.
pub struct Initialiser<F> {
    pub cmd_code: u16,
    pub cmd_version: u8,
    pub fill: F,
}

impl<F> Initialiser<F>
where F: Fn(&mut Payload) + Send + Sync
{
    pub fn new(cmd_code: u16, cmd_version: u8, fill: F) -> Self {
        Self {
            cmd_code,
            cmd_version,
            fill,
        }
    }

    async fn send_and_classify(
        &self,
        handle: &RequestHandle,
        working: &SharedWorking,
    ) -> Result<InitOutcome, RocError> {
        working.enter_initialising();

        let mut payload = Payload::new();
        payload.add(&self.cmd_code).add(&self.cmd_version);
        (self.fill)(&mut payload);

        let reply = handle.send_and_receive(payload).await;

        let outcome = match reply {
            Ok(body) => {
                let status = *body
                    .first()
                    .ok_or_else(|| RocError::Protocol("empty initial reply".into()))?;
                match status {
                    STATUS_REQUEST_NOT_SUPPORTED => {
                        Ok(InitOutcome::Unsupported(UnsupportedKind::RequestNotSupported))
                    },
                    STATUS_REQUEST_VERSION_NOT_SUPPORTED => Ok(InitOutcome::Unsupported(
                        UnsupportedKind::RequestVersionNotSupported,
                    )),
                    _ => Ok(InitOutcome::Ready),
                }
            },
            Err(e) => Err(e),
        };

        if working.exit_initialising_and_check_all_done() {
            working.fire_started();
        }

        outcome
    }
}

#[async_trait]
impl<F> InitialiserLike for Initialiser<F>
where F: Fn(&mut Payload) + Send + Sync
{
    async fn initialise(
        &self,
        handle: &RequestHandle,
        working: &SharedWorking,
    ) -> Result<InitOutcome, RocError> {
        self.send_and_classify(handle, working).await
    }

    fn reset(&self, _outcome: &InitOutcome) {}
}

/// Wraps a standard `Initialiser` with the suspendable protocol's extra
/// steps: abort without sending if the request has already been told to
/// stop, and track `ready_for_state_change` around the send.
pub struct SuspendableInitialiser<'a, F> {
    pub inner: Initialiser<F>,
    pub shared: &'a SuspendableShared,
}

impl<'a, F> SuspendableInitialiser<'a, F>
where F: Fn(&mut Payload) + Send + Sync
{
    pub fn new(inner: Initialiser<F>, shared: &'a SuspendableShared) -> Self {
        Self { inner, shared }
    }
}

#[async_trait]
impl<'a, F> InitialiserLike for SuspendableInitialiser<'a, F>
where F: Fn(&mut Payload) + Send + Sync + 'a
{
    async fn initialise(
        &self,
        handle: &RequestHandle,
        working: &SharedWorking,
    ) -> Result<InitOutcome, RocError> {
        if self.shared.desired_state() == DesiredState::Stopped {
            return Ok(InitOutcome::Aborted);
        }
        let outcome = self.inner.send_and_classify(handle, working).await?;
        if outcome == InitOutcome::Ready {
            self.shared.mark_ready_for_state_change();
        }
        Ok(outcome)
    }

    fn reset(&self, outcome: &InitOutcome) {
        if *outcome == InitOutcome::Ready {
            self.shared.mark_not_ready_for_state_change();
        }
        self.inner.reset(outcome);
    }
}
