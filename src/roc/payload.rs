// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Request body builder handed to handlers when they ask to send
//! (SPEC_FULL.md §4.5). Small fixed-size fields are staged through an
//! inline 256-byte scratch buffer before being appended to the growing
//! `BytesMut`, the same two-tier layout the wire codec uses for headers.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{Immutable, IntoBytes};

const SCRATCH_LEN: usize = 256;

/// A write-only body builder. One `Payload` is built per send; it does not
/// survive past the call that fills it.
pub struct Payload {
    buf: BytesMut,
    scratch: [u8; SCRATCH_LEN],
}

impl Payload {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            scratch: [0u8; SCRATCH_LEN],
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(cap),
            scratch: [0u8; SCRATCH_LEN],
        }
    }

    /// Appends the raw byte representation of a fixed-size, plain-old-data
    /// value, as produced by its `IntoBytes` impl.
    pub fn add<T: IntoBytes + Immutable + ?Sized>(&mut self, value: &T) -> &mut Self {
        self.buf.put_slice(value.as_bytes());
        self
    }

    /// Appends a length-prefixed (u32, wire order implied by the value's own
    /// byte representation) array of fixed-size values.
    pub fn add_array<T: IntoBytes + Immutable>(&mut self, values: &[T]) -> &mut Self {
        self.buf.put_u32(values.len() as u32);
        for v in values {
            self.buf.put_slice(v.as_bytes());
        }
        self
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Materializes `value` through the inline scratch buffer before
    /// appending it. Exists for callers assembling a small `Copy` value out
    /// of several pieces in one place rather than one `add` call at a time;
    /// panics if the value doesn't fit in the 256-byte scratch.
    pub fn add_via_scratch<T: IntoBytes + Immutable + Copy>(&mut self, value: T) -> &mut Self {
        let bytes = value.as_bytes();
        assert!(
            bytes.len() <= SCRATCH_LEN,
            "value of {} bytes exceeds the {SCRATCH_LEN}-byte payload scratch",
            bytes.len()
        );
        self.scratch[..bytes.len()].copy_from_slice(bytes);
        self.buf.put_slice(&self.scratch[..bytes.len()]);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::new()
    }
}
