// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `RequestSet`: allocates `RequestId`s, assigns requests to connections
//! per their `RequestKind`, and owns the resulting `RequestRecord`s
//! (SPEC_FULL.md §4.6).

use std::{
    any::Any,
    future::Future,
    sync::{Arc, Weak},
};

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::{
    connection::ConnectionHandle,
    dispatch::ConnectionSet,
    error::RequestSetError,
    request_set::{
        RequestId, RequestIdGenerator,
        record::{FinishedNotifier, RequestRecord},
    },
    roc::RequestHandle,
};

pub use crate::dispatch::RequestKind;

/// A `RequestId` plus the marker a caller must present back to
/// `get_request_controller` — see `RequestRecord`'s doc comment for why this
/// stands in for spec.md's `handler_fn_pointer` check.
pub struct Assignment {
    pub id: RequestId,
    pub marker: Arc<()>,
}

/// Holds the admission permit for as long as any of a request's
/// request-on-connection tasks are alive; dropped (releasing the permit)
/// only after `all_finished_notifier` has run.
struct AdmittedRequest {
    record: Arc<RequestRecord>,
    _permit: OwnedSemaphorePermit,
}

pub struct RequestSet {
    connections: Arc<ConnectionSet>,
    id_gen: RequestIdGenerator,
    records: DashMap<RequestId, AdmittedRequest>,
    admission: Arc<Semaphore>,
    self_ref: Weak<RequestSet>,
}

impl RequestSet {
    /// spec.md §4.6: destruction is lazy — a `RequestRecord` frees itself the
    /// moment `all_finished_notifier` has run, with no caller bookkeeping
    /// required. `Arc::new_cyclic` hands back a `Weak` this instance can
    /// upgrade later to reach `forget` from inside the wrapped notifier built
    /// in `new_record`.
    pub fn new(connections: Arc<ConnectionSet>, max_requests: usize) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            connections,
            id_gen: RequestIdGenerator::default(),
            records: DashMap::new(),
            admission: Arc::new(Semaphore::new(max_requests)),
            self_ref: self_ref.clone(),
        })
    }

    fn try_admit(&self) -> Result<OwnedSemaphorePermit, RequestSetError> {
        Arc::clone(&self.admission)
            .try_acquire_owned()
            .map_err(|_| RequestSetError::NoMoreRequests)
    }

    /// Common bookkeeping for every `start_*` entry point: allocates an id,
    /// admits it, builds the record, and installs a notifier wrapper that
    /// frees the record (and the admission permit) once every
    /// request-on-connection has finished.
    fn new_record(
        &self,
        kind: RequestKind,
        ctx: Arc<dyn Any + Send + Sync>,
        all_finished_notifier: FinishedNotifier,
    ) -> Result<(RequestId, Arc<RequestRecord>, Arc<()>, OwnedSemaphorePermit), RequestSetError>
    {
        let permit = self.try_admit()?;
        let id = self.id_gen.alloc();
        let marker = Arc::new(());
        let self_ref = self.self_ref.clone();
        let wrapped: FinishedNotifier = Arc::new(move |id, ctx| {
            (all_finished_notifier)(id, ctx);
            if let Some(set) = self_ref.upgrade() {
                set.forget(id);
            }
        });
        let record = Arc::new(RequestRecord::new(id, kind, ctx, Arc::clone(&marker), wrapped));
        Ok((id, record, marker, permit))
    }

    fn install(&self, id: RequestId, record: Arc<RequestRecord>, permit: OwnedSemaphorePermit) {
        self.records.insert(id, AdmittedRequest {
            record,
            _permit: permit,
        });
    }

    /// Spawns one request-on-connection task, wiring it into `record`'s
    /// controller slot and roc-count bookkeeping.
    fn spawn_roc<F, Fut>(&self, record: &Arc<RequestRecord>, conn: ConnectionHandle, handler: F)
    where
        F: FnOnce(RequestHandle) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let slot = record.register_roc_slot(conn.clone());
        let handle = RequestHandle::new(record.id, conn).with_controller(Arc::clone(record), slot);
        record.roc_started();
        let record = Arc::clone(record);
        tokio::spawn(async move {
            handler(handle).await;
            record.deregister_roc_slot(slot);
            record.roc_finished();
        });
    }

    /// Picks one connection (the caller decides which, per spec.md §4.6:
    /// "caller-specified within handler") and runs one request-on-connection
    /// on it.
    pub fn start_single_node<F, Fut>(
        &self,
        conn: ConnectionHandle,
        ctx: Arc<dyn Any + Send + Sync>,
        all_finished_notifier: FinishedNotifier,
        handler: F,
    ) -> Result<Assignment, RequestSetError>
    where
        F: FnOnce(RequestHandle) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (id, record, marker, permit) =
            self.new_record(RequestKind::SingleNode, ctx, all_finished_notifier)?;
        self.spawn_roc(&record, conn, handler);
        self.install(id, record, permit);
        trace!(request_id = %id, kind = ?RequestKind::SingleNode, "started request");
        Ok(Assignment { id, marker })
    }

    /// Picks the next connection in the set's rotation.
    pub fn start_round_robin<F, Fut>(
        &self,
        ctx: Arc<dyn Any + Send + Sync>,
        all_finished_notifier: FinishedNotifier,
        handler: F,
    ) -> Result<Assignment, RequestSetError>
    where
        F: FnOnce(RequestHandle) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let conn = self
            .connections
            .next_round_robin()
            .ok_or(RequestSetError::NoNodesRegistered)?;
        let (id, record, marker, permit) =
            self.new_record(RequestKind::RoundRobin, ctx, all_finished_notifier)?;
        self.spawn_roc(&record, conn, handler);
        self.install(id, record, permit);
        trace!(request_id = %id, kind = ?RequestKind::RoundRobin, "started request");
        Ok(Assignment { id, marker })
    }

    /// Runs one request-on-connection per connection in `conns`, each built
    /// by calling `handler_for` with that connection.
    pub fn start_multi_node<F, Fut>(
        &self,
        conns: Vec<ConnectionHandle>,
        ctx: Arc<dyn Any + Send + Sync>,
        all_finished_notifier: FinishedNotifier,
        mut handler_for: F,
    ) -> Result<Assignment, RequestSetError>
    where
        F: FnMut(ConnectionHandle) -> Box<dyn FnOnce(RequestHandle) -> Fut + Send>,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if conns.is_empty() {
            return Err(RequestSetError::NoNodesRegistered);
        }
        let (id, record, marker, permit) =
            self.new_record(RequestKind::MultiNode, ctx, all_finished_notifier)?;
        for conn in conns {
            let handler = handler_for(conn.clone());
            self.spawn_roc(&record, conn, handler);
        }
        self.install(id, record, permit);
        trace!(request_id = %id, kind = ?RequestKind::MultiNode, "started request");
        Ok(Assignment { id, marker })
    }

    /// Runs one request-on-connection per currently registered connection.
    /// Connections registered after this call does not retroactively grow
    /// the request (spec.md §4.6: a snapshot is taken at start time; the
    /// all-nodes kit, §4.9, is what keeps a long-running request alive
    /// across reconnects of its own connections, not across newly joined
    /// ones).
    pub fn start_all_nodes<F, Fut>(
        &self,
        ctx: Arc<dyn Any + Send + Sync>,
        all_finished_notifier: FinishedNotifier,
        mut handler_for: F,
    ) -> Result<Assignment, RequestSetError>
    where
        F: FnMut(ConnectionHandle) -> Box<dyn FnOnce(RequestHandle) -> Fut + Send>,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let conns = self.connections.all();
        if conns.is_empty() {
            return Err(RequestSetError::NoNodesRegistered);
        }
        let (id, record, marker, permit) =
            self.new_record(RequestKind::AllNodes, ctx, all_finished_notifier)?;
        for conn in conns {
            let handler = handler_for(conn.clone());
            self.spawn_roc(&record, conn, handler);
        }
        self.install(id, record, permit);
        trace!(request_id = %id, kind = ?RequestKind::AllNodes, "started request");
        Ok(Assignment { id, marker })
    }

    /// Returns the record for `id`, checked against `marker` the way
    /// spec.md's `getRequestController` checks `handler_fn_pointer`. Used by
    /// the controller module to build an `IRequestController`.
    pub fn get_request_controller(
        &self,
        id: RequestId,
        marker: &Arc<()>,
    ) -> Result<Arc<RequestRecord>, RequestSetError> {
        let entry = self
            .records
            .get(&id)
            .ok_or(RequestSetError::UnknownRequest(id))?;
        if !entry.record.matches_marker(marker) {
            return Err(RequestSetError::UnknownRequest(id));
        }
        Ok(Arc::clone(&entry.record))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops the bookkeeping for a request whose `all_finished_notifier` has
    /// already run, releasing its admission permit. Called automatically
    /// once `new_record`'s wrapped notifier runs (spec.md §4.6's lazy
    /// destruction); exposed so a caller that already holds an `Assignment`
    /// can drop it early, but idempotent against the automatic call.
    pub fn forget(&self, id: RequestId) {
        self.records.remove(&id);
    }
}
