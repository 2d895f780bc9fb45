// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Controllers: the late, out-of-band channel user code uses to reach into a
//! running request (SPEC_FULL.md §4.7). `Controller` is the generic,
//! request-type-specific variant; `SuspendableController` is built on the
//! request-type-independent suspend/resume/stop protocol spec.md describes.

mod suspendable;

use std::{any::Any, sync::Arc};

use crate::{error::RequestSetError, request_set::RequestId};
pub use suspendable::{
    ControlMessage, DesiredState, SIGNAL_STATE_CHANGE_REQUESTED, SuspendableController,
    SuspendableShared,
};

/// The subset of `RequestSet` a controller needs: look up a still-live
/// request's record and its request-specific context, checked against the
/// marker the caller was handed at assignment time.
pub trait ControllerSource {
    fn lookup(
        &self,
        id: RequestId,
        marker: &Arc<()>,
    ) -> Result<Arc<crate::request_set::RequestRecord>, RequestSetError>;
}

impl ControllerSource for crate::request_set::RequestSet {
    fn lookup(
        &self,
        id: RequestId,
        marker: &Arc<()>,
    ) -> Result<Arc<crate::request_set::RequestRecord>, RequestSetError> {
        self.get_request_controller(id, marker)
    }
}

/// A scope-lifetime handle bound to one `RequestId`. `control` hands the
/// request's own context blob (downcast to whatever typed interface the
/// specific request defined) to the caller's closure; it fails if the
/// request has already finished.
pub struct Controller<'a, S: ControllerSource> {
    source: &'a S,
    id: RequestId,
    marker: Arc<()>,
}

impl<'a, S: ControllerSource> Controller<'a, S> {
    pub fn new(source: &'a S, id: RequestId, marker: Arc<()>) -> Self {
        Self { source, id, marker }
    }

    pub fn request_id(&self) -> RequestId {
        self.id
    }

    /// Downcasts the request's context blob to `T` and hands it to `f`.
    /// Returns an error if the request no longer exists or the context isn't
    /// actually a `T` (the latter would be a caller bug: the type must match
    /// what the request itself stored).
    pub fn control<T, R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, RequestSetError>
    where T: Any + Send + Sync + 'static {
        let record = self.source.lookup(self.id, &self.marker)?;
        let ctx = record
            .ctx
            .downcast_ref::<T>()
            .ok_or(RequestSetError::UnknownRequest(self.id))?;
        Ok(f(ctx))
    }

    /// Resumes every currently-suspended request-on-connection of this
    /// request with an arbitrary out-of-band `code` (SPEC_FULL.md §5: "a
    /// sentinel code" for e.g. a caller-imposed timeout). RoCs that aren't
    /// suspended right now are left alone, same as the suspendable
    /// protocol's `resumeSuspendedHandlers`.
    pub fn resume_with_code(&self, code: i64) -> Result<(), RequestSetError> {
        let record = self.source.lookup(self.id, &self.marker)?;
        record.resume_all_with_code(code);
        Ok(())
    }
}
