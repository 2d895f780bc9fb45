// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The framed-I/O layer: one `Frame` in, one `Frame` out. Everything above
//! this module only ever sees whole frames.

pub mod codec;

pub use codec::{Frame, FrameCodec, MessageType};
