// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Request kinds and the connection set requests are dispatched over
//! (SPEC_FULL.md §4.8). `RequestKind` is a property of a request *type*
//! (enforced at compile time via `RequestCore`), never a per-call choice.

use std::net::IpAddr;

use dashmap::DashMap;

use crate::connection::ConnectionHandle;

/// How a request is spread across connections (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// One request-on-connection on one chosen connection. A failure ends
    /// the request; there is no kit-level retry.
    SingleNode,
    /// One request-on-connection on the next connection in the set's
    /// rotation. Retrying on a different connection, if desired, is the
    /// request type's own policy.
    RoundRobin,
    /// One request-on-connection per connection in a request-chosen subset.
    /// Each runs and fails independently of the others.
    MultiNode,
    /// One request-on-connection per currently registered connection, with
    /// per-connection reconnect/retry handled by the all-nodes kit
    /// (SPEC_FULL.md §4.9).
    AllNodes,
}

/// Binds a request type to its dispatch kind at compile time — stronger than
/// spec.md's runtime `handler_fn_pointer`-style check, since a request type
/// can never be started under the wrong kind in the first place.
pub trait RequestCore {
    const KIND: RequestKind;
}

/// The set of connections requests are dispatched over: one `Connection` per
/// `(addr, port)`, keyed the same way spec.md's ConnectionSet is, plus an
/// atomic cursor for round-robin selection.
pub struct ConnectionSet {
    connections: DashMap<(IpAddr, u16), ConnectionHandle>,
    round_robin_cursor: std::sync::atomic::AtomicUsize,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            round_robin_cursor: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Inserts `conn` keyed by its own address, at most once per address:
    /// an existing entry for the same key is left untouched and `false` is
    /// returned.
    pub fn insert(&self, conn: ConnectionHandle) -> bool {
        use dashmap::mapref::entry::Entry;
        let addr = conn.addr();
        match self.connections.entry((addr.ip(), addr.port())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(conn);
                true
            },
        }
    }

    pub fn remove(&self, ip: IpAddr, port: u16) -> Option<ConnectionHandle> {
        self.connections.remove(&(ip, port)).map(|(_, c)| c)
    }

    pub fn get(&self, ip: IpAddr, port: u16) -> Option<ConnectionHandle> {
        self.connections.get(&(ip, port)).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot of every currently registered connection, in an unspecified
    /// iteration order (spec.md §2: "iteration order not externally
    /// visible").
    pub fn all(&self) -> Vec<ConnectionHandle> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Picks the next connection in rotation. Returns `None` if no
    /// connections are registered. The cursor advances regardless of which
    /// connection is returned, so concurrent callers fan out roughly evenly
    /// even though the underlying map has no stable order.
    pub fn next_round_robin(&self) -> Option<ConnectionHandle> {
        let snapshot = self.all();
        if snapshot.is_empty() {
            return None;
        }
        let i = self
            .round_robin_cursor
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            % snapshot.len();
        Some(snapshot[i].clone())
    }

    /// Picks up to `k` distinct connections, in the set's current snapshot
    /// order, for a multi-node request.
    pub fn pick_multi(&self, k: usize) -> Vec<ConnectionHandle> {
        let mut snapshot = self.all();
        snapshot.truncate(k);
        snapshot
    }
}

impl Default for ConnectionSet {
    fn default() -> Self {
        Self::new()
    }
}
