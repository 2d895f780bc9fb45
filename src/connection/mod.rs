// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The Connection engine: one TCP socket, one sender task, one receiver
//! task, a send queue and a receive set.

pub mod engine;
pub mod receive_set;
pub mod send_queue;

pub use engine::{Connection, ConnectionConfig, ConnectionHandle, ConnState};
pub use receive_set::ReceiveSet;
pub use send_queue::SendQueue;
