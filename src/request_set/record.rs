// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    any::Any,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use dashmap::DashMap;
use tracing::trace;

use crate::{connection::ConnectionHandle, dispatch::RequestKind, request_set::RequestId};

/// One request-on-connection's current suspend point, tracked so a
/// controller can resume it with an out-of-band code (SPEC_FULL.md §4.7,
/// `resumeSuspendedHandlers`). `generation == 0` means "not currently
/// suspended" — either still running or already resumed.
struct RocSlot {
    conn: ConnectionHandle,
    generation: AtomicU64,
}

/// Runs once, when the last request-on-connection of a `RequestRecord`
/// terminates.
pub type FinishedNotifier = Arc<dyn Fn(RequestId, &Arc<dyn Any + Send + Sync>) + Send + Sync>;

/// Bookkeeping for one assigned request: how many request-on-connection
/// tasks are still alive, the request-specific context blob, and the
/// exactly-once "all finished" callback.
///
/// `notifier_marker` is the Rust realization of spec.md's
/// `handler_fn_pointer` runtime safety check: `RequestSet::get_request_controller`
/// takes the same `Arc` the caller received when it started the request and
/// rejects mismatches via `Arc::ptr_eq`, which substitutes for a
/// compile-time guarantee that the controller's typed view matches the
/// handler that is actually running.
pub struct RequestRecord {
    pub id: RequestId,
    pub kind: RequestKind,
    pub ctx: Arc<dyn Any + Send + Sync>,
    notifier_marker: Arc<()>,
    roc_count: AtomicUsize,
    finished_once: AtomicBool,
    all_finished_notifier: FinishedNotifier,
    roc_slots: DashMap<u64, RocSlot>,
    next_slot: AtomicU64,
}

impl RequestRecord {
    pub fn new(
        id: RequestId,
        kind: RequestKind,
        ctx: Arc<dyn Any + Send + Sync>,
        notifier_marker: Arc<()>,
        all_finished_notifier: FinishedNotifier,
    ) -> Self {
        Self {
            id,
            kind,
            ctx,
            notifier_marker,
            roc_count: AtomicUsize::new(0),
            finished_once: AtomicBool::new(false),
            all_finished_notifier,
            roc_slots: DashMap::new(),
            next_slot: AtomicU64::new(1),
        }
    }

    pub fn matches_marker(&self, marker: &Arc<()>) -> bool {
        Arc::ptr_eq(&self.notifier_marker, marker)
    }

    /// Reserves a slot for one request-on-connection's suspend state.
    pub fn register_roc_slot(&self, conn: ConnectionHandle) -> u64 {
        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        self.roc_slots.insert(
            slot,
            RocSlot {
                conn,
                generation: AtomicU64::new(0),
            },
        );
        slot
    }

    pub fn deregister_roc_slot(&self, slot: u64) {
        self.roc_slots.remove(&slot);
    }

    /// Records that the request-on-connection owning `slot` has just
    /// suspended awaiting `generation`.
    pub fn set_generation(&self, slot: u64, generation: u64) {
        if let Some(entry) = self.roc_slots.get(&slot) {
            entry.generation.store(generation, Ordering::SeqCst);
        }
    }

    /// Records that the request-on-connection owning `slot` has just woken
    /// up (whatever the reason), so a controller resume no longer targets
    /// it.
    pub fn clear_generation(&self, slot: u64) {
        if let Some(entry) = self.roc_slots.get(&slot) {
            entry.generation.store(0, Ordering::SeqCst);
        }
    }

    /// Resumes every request-on-connection of this request that is
    /// currently suspended, with `code`; those not currently suspended
    /// (still running, or between suspends) are left alone, exactly as
    /// spec.md's `resumeSuspendedHandlers` describes.
    pub fn resume_all_with_code(&self, code: i64) {
        for entry in self.roc_slots.iter() {
            let slot = entry.value();
            let generation = slot.generation.swap(0, Ordering::SeqCst);
            if generation != 0 {
                slot.conn.resume_with_code(self.id, generation, code);
            }
        }
    }

    /// Registers a newly spawned request-on-connection task.
    pub fn roc_started(&self) {
        self.roc_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Called when a request-on-connection's handler terminates (normally
    /// or by error). Fires `all_finished_notifier` exactly once, the moment
    /// the count reaches zero.
    pub fn roc_finished(self: &Arc<Self>) {
        let remaining = self.roc_count.fetch_sub(1, Ordering::SeqCst) - 1;
        trace!(request_id = %self.id, remaining, "roc finished");
        if remaining == 0
            && self
                .finished_once
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            (self.all_finished_notifier)(self.id, &self.ctx);
        }
    }

    pub fn roc_count(&self) -> usize {
        self.roc_count.load(Ordering::SeqCst)
    }
}
