// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The request-type-independent suspend/resume/stop protocol (SPEC_FULL.md
//! §4.7). `SuspendableShared` is the request-scoped state every
//! request-on-connection of a suspendable all-nodes request shares; the
//! all-nodes kit (`crate::all_nodes`) drives its per-connection side, this
//! module owns the user-facing `SuspendableController` and the shared atomics.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
};

use tokio::sync::Notify;

use crate::{controller::ControllerSource, error::RequestSetError, request_set::RequestId};

/// User intent for a suspendable request's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DesiredState {
    Running = 0,
    Suspended = 1,
    Stopped = 2,
}

impl DesiredState {
    fn from_u8(b: u8) -> Self {
        match b {
            1 => DesiredState::Suspended,
            2 => DesiredState::Stopped,
            _ => DesiredState::Running,
        }
    }
}

/// Control-message bytes carried as the body of a `Request` message between
/// a suspendable request's controller fiber and the node (SPEC_FULL.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlMessage {
    Suspend = 1,
    Resume = 2,
    Stop = 3,
    Ack = 4,
}

impl TryFrom<u8> for ControlMessage {
    type Error = ();

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            1 => Ok(ControlMessage::Suspend),
            2 => Ok(ControlMessage::Resume),
            3 => Ok(ControlMessage::Stop),
            4 => Ok(ControlMessage::Ack),
            _ => Err(()),
        }
    }
}

impl From<DesiredState> for ControlMessage {
    fn from(s: DesiredState) -> Self {
        match s {
            DesiredState::Running => ControlMessage::Resume,
            DesiredState::Suspended => ControlMessage::Suspend,
            DesiredState::Stopped => ControlMessage::Stop,
        }
    }
}

/// Out-of-band code delivered through `RequestHandle::next_event`'s
/// `ResumedWithCode` path to ask a request-on-connection's control loop to
/// re-check `desired_state` (SPEC_FULL.md §4.9).
pub const SIGNAL_STATE_CHANGE_REQUESTED: i64 = 1;

/// Shared state for one suspendable all-nodes request, referenced by every
/// one of its request-on-connections as well as by the user-facing
/// `SuspendableController`. Stored as the request's `ctx` blob so
/// `Controller`/`SuspendableController` can reach it through
/// `RequestSet::get_request_controller`.
pub struct SuspendableShared {
    desired_state: AtomicU8,
    changing_state: AtomicU32,
    ready_for_state_change: AtomicU32,
    stopped_notification_done: AtomicBool,
    notify: Notify,
    notifier: Box<dyn Fn(DesiredState) + Send + Sync>,
}

impl SuspendableShared {
    pub fn new(
        initial: DesiredState,
        notifier: impl Fn(DesiredState) + Send + Sync + 'static,
    ) -> Self {
        Self {
            desired_state: AtomicU8::new(initial as u8),
            changing_state: AtomicU32::new(0),
            ready_for_state_change: AtomicU32::new(0),
            stopped_notification_done: AtomicBool::new(false),
            notify: Notify::new(),
            notifier: Box::new(notifier),
        }
    }

    pub fn desired_state(&self) -> DesiredState {
        DesiredState::from_u8(self.desired_state.load(Ordering::SeqCst))
    }

    /// Requests a state change. Returns `false` without touching anything
    /// else if a state change is already in flight (spec.md §4.7 step 1).
    pub fn request_change(&self, new_state: DesiredState) -> bool {
        if self.changing_state.load(Ordering::SeqCst) > 0 {
            return false;
        }
        self.desired_state.store(new_state as u8, Ordering::SeqCst);
        if self.ready_for_state_change.load(Ordering::SeqCst) > 0 {
            self.notify.notify_waiters();
        } else {
            self.fire_notification(new_state);
        }
        true
    }

    /// Called by a control loop immediately before sending the matching
    /// control message. Returns the new `changing_state` count.
    pub fn begin_sending(&self) -> u32 {
        self.changing_state.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Called after the control message was acked. Returns the new
    /// `changing_state` count; the caller fires the user notification when
    /// this reaches 0.
    pub fn ack_received(&self) -> u32 {
        self.changing_state.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn mark_ready_for_state_change(&self) -> u32 {
        self.ready_for_state_change.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn mark_not_ready_for_state_change(&self) -> u32 {
        self.ready_for_state_change.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn ready_for_state_change(&self) -> u32 {
        self.ready_for_state_change.load(Ordering::SeqCst)
    }

    pub fn changing_state(&self) -> u32 {
        self.changing_state.load(Ordering::SeqCst)
    }

    /// Resolves once another task calls `request_change` while at least one
    /// request-on-connection is ready for a state change.
    pub async fn wait_for_signal(&self) {
        self.notify.notified().await;
    }

    /// Fires the user-visible notification for `state`. `Stopped` fires at
    /// most once per request (spec.md §4.7's `stopped_notification_done`);
    /// `Suspended`/`Resumed` may recur across a request's lifetime.
    pub fn fire_notification(&self, state: DesiredState) {
        if state == DesiredState::Stopped
            && self
                .stopped_notification_done
                .swap(true, Ordering::SeqCst)
        {
            return;
        }
        (self.notifier)(state);
    }
}

/// A controller bound to one suspendable request. `suspend`/`resume`/`stop`
/// mirror spec.md §4.7's user-facing surface exactly: each returns `false`
/// if a state change is already in flight, and throws (here: `Err`) if the
/// request no longer exists.
pub struct SuspendableController<'a, S: ControllerSource> {
    source: &'a S,
    id: RequestId,
    marker: Arc<()>,
}

impl<'a, S: ControllerSource> SuspendableController<'a, S> {
    pub fn new(source: &'a S, id: RequestId, marker: Arc<()>) -> Self {
        Self { source, id, marker }
    }

    fn request(&self, state: DesiredState) -> Result<bool, RequestSetError> {
        let record = self.source.lookup(self.id, &self.marker)?;
        let shared = record
            .ctx
            .downcast_ref::<SuspendableShared>()
            .ok_or(RequestSetError::UnknownRequest(self.id))?;
        let changed = shared.request_change(state);
        if changed {
            // Wake every request-on-connection currently parked in its
            // receive wait so it notices the new `desired_state` and runs
            // the control exchange; RoCs not suspended right now pick it up
            // the next time they reach `drive_handler`'s receive wait.
            record.resume_all_with_code(SIGNAL_STATE_CHANGE_REQUESTED);
        }
        Ok(changed)
    }

    pub fn suspend(&self) -> Result<bool, RequestSetError> {
        self.request(DesiredState::Suspended)
    }

    pub fn resume(&self) -> Result<bool, RequestSetError> {
        self.request(DesiredState::Running)
    }

    pub fn stop(&self) -> Result<bool, RequestSetError> {
        self.request(DesiredState::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn changing_state_reaches_zero_only_after_every_ack() {
        let shared = SuspendableShared::new(DesiredState::Running, |_| {});
        assert_eq!(shared.begin_sending(), 1);
        assert_eq!(shared.begin_sending(), 2);
        assert_eq!(shared.ack_received(), 1);
        assert_eq!(shared.changing_state(), 1);
        assert_eq!(shared.ack_received(), 0);
        assert_eq!(shared.changing_state(), 0);
    }

    #[test]
    fn notifier_fires_exactly_once_when_changing_state_returns_to_zero() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let shared = SuspendableShared::new(DesiredState::Running, move |_s| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });

        shared.begin_sending();
        shared.begin_sending();
        assert_eq!(shared.ack_received(), 1);
        if shared.changing_state() == 0 {
            shared.fire_notification(DesiredState::Suspended);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(shared.ack_received(), 0);
        if shared.changing_state() == 0 {
            shared.fire_notification(DesiredState::Suspended);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stopped_notification_fires_at_most_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let shared = SuspendableShared::new(DesiredState::Running, move |_s| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        shared.fire_notification(DesiredState::Stopped);
        shared.fire_notification(DesiredState::Stopped);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn request_change_rejected_while_a_change_is_in_flight() {
        let shared = SuspendableShared::new(DesiredState::Running, |_| {});
        shared.begin_sending();
        assert!(!shared.request_change(DesiredState::Suspended));
        shared.ack_received();
        assert!(shared.request_change(DesiredState::Suspended));
    }

    #[test]
    fn fires_immediately_when_no_connection_is_ready() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let shared = SuspendableShared::new(DesiredState::Running, move |s| {
            assert_eq!(s, DesiredState::Stopped);
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(shared.request_change(DesiredState::Stopped));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
