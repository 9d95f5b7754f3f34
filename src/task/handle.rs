//! Task handles: unique and shared ownership over a computation.
//!
//! Both handle types drive the same continuation state; they differ only in
//! ownership. A handle whose computation was detached (via
//! [`reset`](UniqueTask::reset)) reports [`Status::Disconnected`] and every
//! operation on it is a safe no-op.
//!
//! Resuming is single-threaded cooperative: handles may move between
//! threads, but only one caller may be resuming a given task tree at a
//! time.

use std::future::Future;
use std::sync::Arc;

use super::co::Co;
use super::promise::Promise;
use super::Status;

/// Solely-owned handle to a suspendable computation.
///
/// Not clonable. Dropping (or [`reset`](Self::reset)ting) the handle
/// destroys the computation outright, even mid-suspension; locals captured
/// by the body are dropped at that point.
///
/// ```
/// use coflow::{Status, UniqueTask};
///
/// let task: UniqueTask<i32> = UniqueTask::new(|co| async move {
///     co.suspend().await;
///     7
/// });
///
/// assert_eq!(task.status(), Status::Suspended);
/// task.resume();
/// task.resume();
/// assert_eq!(task.status(), Status::Done);
/// assert_eq!(task.consume(), Some(7));
/// ```
pub struct UniqueTask<R, Y = ()> {
    promise: Option<Arc<Promise<R, Y>>>,
}

impl<R, Y> UniqueTask<R, Y>
where
    R: Send + 'static,
    Y: Send + 'static,
{
    /// Create a suspended computation from `f`. The body does not run
    /// until the first [`resume`](Self::resume).
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Co<Y>) -> Fut,
        Fut: Future<Output = R> + Send + 'static,
    {
        Self {
            promise: Some(Promise::new(f)),
        }
    }

    /// Drive the computation one step. See the module docs of
    /// [`crate::task`] for the full resume semantics.
    pub fn resume(&self) {
        if let Some(promise) = &self.promise {
            promise.resume();
        }
    }

    /// Current status, or `Disconnected` for a detached handle.
    pub fn status(&self) -> Status {
        self.promise
            .as_ref()
            .map_or(Status::Disconnected, |promise| promise.status())
    }

    /// Cancel the computation; terminal unless it already finished.
    pub fn cancel(&self) {
        if let Some(promise) = &self.promise {
            promise.cancel();
        }
    }

    /// Return-and-clear the return value. Filled only at completion, and
    /// only handed out once.
    pub fn consume(&self) -> Option<R> {
        self.promise.as_ref().and_then(|promise| promise.take_return())
    }

    /// Return-and-clear the most recent yielded value.
    pub fn consume_yield(&self) -> Option<Y> {
        self.promise.as_ref().and_then(|promise| promise.take_yield())
    }

    /// Detach the handle, destroying the computation.
    pub fn reset(&mut self) {
        self.promise = None;
    }

    pub(crate) fn into_promise(self) -> Option<Arc<Promise<R, Y>>> {
        self.promise
    }
}

/// Reference-counted handle to a suspendable computation.
///
/// Clones alias the same computation: all of them observe the same status
/// and slots, and the computation is destroyed only when the last clone is
/// released.
///
/// ```
/// use coflow::{SharedTask, Status};
///
/// let first: SharedTask<i32> = SharedTask::new(|co| async move {
///     co.suspend().await;
///     7
/// });
/// let second = first.clone();
///
/// first.resume();
/// first.resume();
/// assert_eq!(second.status(), Status::Done);
/// assert_eq!(second.consume(), Some(7));
/// assert_eq!(first.consume(), None); // consume-once, shared slot
/// ```
pub struct SharedTask<R, Y = ()> {
    promise: Option<Arc<Promise<R, Y>>>,
}

impl<R, Y> Clone for SharedTask<R, Y> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<R, Y> SharedTask<R, Y>
where
    R: Send + 'static,
    Y: Send + 'static,
{
    /// Create a suspended computation from `f`.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Co<Y>) -> Fut,
        Fut: Future<Output = R> + Send + 'static,
    {
        Self {
            promise: Some(Promise::new(f)),
        }
    }

    /// Drive the computation one step.
    pub fn resume(&self) {
        if let Some(promise) = &self.promise {
            promise.resume();
        }
    }

    /// Current status, or `Disconnected` for a detached handle.
    pub fn status(&self) -> Status {
        self.promise
            .as_ref()
            .map_or(Status::Disconnected, |promise| promise.status())
    }

    /// Cancel the computation; terminal unless it already finished.
    pub fn cancel(&self) {
        if let Some(promise) = &self.promise {
            promise.cancel();
        }
    }

    /// Return-and-clear the return value.
    pub fn consume(&self) -> Option<R> {
        self.promise.as_ref().and_then(|promise| promise.take_return())
    }

    /// Return-and-clear the most recent yielded value.
    pub fn consume_yield(&self) -> Option<Y> {
        self.promise.as_ref().and_then(|promise| promise.take_yield())
    }

    /// Release this handle's reference. The computation is destroyed once
    /// every clone is released.
    pub fn reset(&mut self) {
        self.promise = None;
    }

    pub(crate) fn into_promise(self) -> Option<Arc<Promise<R, Y>>> {
        self.promise
    }
}
