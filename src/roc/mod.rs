// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Request-on-Connection: the per-request cooperative task abstraction.
//! `RequestHandle` is the `EventDispatcher` surface handlers are given
//! (SPEC_FULL.md §4.5); `Payload` is the scope-lifetime body builder.

mod handle;
mod payload;

pub use handle::{EventFlags, RequestHandle, RocEvent};
pub use payload::Payload;
