//! Continuation state for suspended computations.
//!
//! A `Promise<R, Y>` is everything that persists between resumes: the
//! status, the single pending wait (a readiness predicate or a nested
//! sub-task), the return and yield slots, and the computation body itself,
//! a pinned future polled once per resume step with a no-op waker.
//! Readiness is decided by re-evaluating the pending wait on every resume,
//! not by wakeups.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use parking_lot::Mutex;
use tracing::warn;

use super::co::Co;
use super::Status;

/// What a suspended computation is currently waiting on. At most one wait
/// is outstanding at a time: a computation suspends on exactly one thing.
pub(crate) enum Wait {
    /// Readiness predicate, re-evaluated on every resume.
    Ready(Box<dyn FnMut() -> bool + Send>),
    /// Nested sub-task gating this computation.
    Child(Arc<dyn DynTask>),
}

/// Type-erased task operations, used for the pending sub-task link and for
/// transitive cancellation.
pub(crate) trait DynTask: Send + Sync {
    fn resume_task(&self);
    fn cancel_task(&self);
    fn task_status(&self) -> Status;
}

/// Status plus pending wait; shared between the promise and the [`Co`]
/// scope so awaiter adapters can register waits from inside the body.
pub(crate) struct CoreState {
    status: AtomicU8,
    wait: Mutex<Option<Wait>>,
}

impl CoreState {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(Status::Suspended.as_u8()),
            wait: Mutex::new(None),
        }
    }

    #[inline]
    pub(crate) fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    #[inline]
    fn store_status(&self, status: Status) {
        self.status.store(status.as_u8(), Ordering::SeqCst);
    }

    /// Register a readiness predicate. The slot must be empty: adapters
    /// only run while the body is being polled, after the previous wait was
    /// cleared.
    pub(crate) fn set_ready(&self, ready: Box<dyn FnMut() -> bool + Send>) {
        let mut wait = self.wait.lock();
        debug_assert!(wait.is_none());
        *wait = Some(Wait::Ready(ready));
    }

    /// Register a pending sub-task. Same contract as [`set_ready`](Self::set_ready).
    pub(crate) fn set_child(&self, child: Arc<dyn DynTask>) {
        let mut wait = self.wait.lock();
        debug_assert!(wait.is_none());
        *wait = Some(Wait::Child(child));
    }

    /// Cancel: drop the pending wait and propagate to a pending sub-task.
    /// No-op once `Done` or `Faulted`. Never runs more of the body.
    pub(crate) fn cancel(&self) {
        if matches!(self.status(), Status::Done | Status::Faulted) {
            return;
        }
        self.store_status(Status::Canceled);
        let pending = self.wait.lock().take();
        if let Some(Wait::Child(child)) = pending {
            child.cancel_task();
        }
    }
}

/// Full continuation state of one computation.
pub(crate) struct Promise<R, Y> {
    core: Arc<CoreState>,
    ret: Arc<Mutex<Option<R>>>,
    yielded: Arc<Mutex<Option<Y>>>,
    body: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,
}

impl<R, Y> Promise<R, Y>
where
    R: Send + 'static,
    Y: Send + 'static,
{
    /// Build the continuation state and wrap the user body so its final
    /// value lands in the return slot.
    pub(crate) fn new<F, Fut>(f: F) -> Arc<Self>
    where
        F: FnOnce(Co<Y>) -> Fut,
        Fut: Future<Output = R> + Send + 'static,
    {
        let core = Arc::new(CoreState::new());
        let ret = Arc::new(Mutex::new(None));
        let yielded = Arc::new(Mutex::new(None));

        let co = Co::new(Arc::clone(&core), Arc::clone(&yielded));
        let fut = f(co);
        let ret_slot = Arc::clone(&ret);
        let body = async move {
            let value = fut.await;
            *ret_slot.lock() = Some(value);
        };

        Arc::new(Self {
            core,
            ret,
            yielded,
            body: Mutex::new(Some(Box::pin(body))),
        })
    }

    #[inline]
    pub(crate) fn status(&self) -> Status {
        self.core.status()
    }

    /// Return-and-clear the return slot.
    pub(crate) fn take_return(&self) -> Option<R> {
        self.ret.lock().take()
    }

    /// Return-and-clear the yield slot.
    pub(crate) fn take_yield(&self) -> Option<Y> {
        self.yielded.lock().take()
    }

    pub(crate) fn cancel(&self) {
        self.core.cancel();
    }

    /// Drive the computation one step.
    ///
    /// No-op unless `Suspended`. A false readiness predicate or a still
    /// suspended sub-task leaves the body untouched. Otherwise the pending
    /// wait is cleared, the body polled once, and the status settles on
    /// `Done`, back to `Suspended`, or whatever the body set on itself
    /// (self-cancellation). A panic in the body becomes `Faulted`.
    pub(crate) fn resume(&self) {
        if self.core.status() != Status::Suspended {
            return;
        }

        // Bind before matching: a guard in the scrutinee would stay locked
        // across the arms, which re-lock the slot.
        let pending = self.core.wait.lock().take();
        match pending {
            Some(Wait::Ready(mut ready)) => {
                if !ready() {
                    *self.core.wait.lock() = Some(Wait::Ready(ready));
                    return;
                }
            }
            Some(Wait::Child(child)) => {
                child.resume_task();
                if child.task_status() == Status::Suspended {
                    *self.core.wait.lock() = Some(Wait::Child(child));
                    return;
                }
            }
            None => {}
        }

        self.core.store_status(Status::Resuming);

        let mut body_slot = self.body.lock();
        let Some(body) = body_slot.as_mut() else {
            // Unreachable while the status protocol holds: the body is only
            // taken out together with a terminal status.
            self.core.store_status(Status::Done);
            return;
        };

        let poll = catch_unwind(AssertUnwindSafe(|| {
            let waker = noop_waker();
            let mut cx = Context::from_waker(&waker);
            body.as_mut().poll(&mut cx)
        }));

        match poll {
            Ok(Poll::Ready(())) => {
                *body_slot = None;
                self.core.store_status(Status::Done);
            }
            Ok(Poll::Pending) => {
                // The body may have set its own terminal status while
                // running (`cancel_self`); only a still-`Resuming` task
                // goes back to `Suspended`.
                if self.core.status() == Status::Resuming {
                    self.core.store_status(Status::Suspended);
                }
            }
            Err(panic) => {
                *body_slot = None;
                self.core.wait.lock().take();
                self.core.store_status(Status::Faulted);
                warn!("task body panicked: {}", panic_message(&panic));
            }
        }
    }
}

impl<R, Y> DynTask for Promise<R, Y>
where
    R: Send + 'static,
    Y: Send + 'static,
{
    fn resume_task(&self) {
        self.resume();
    }

    fn cancel_task(&self) {
        self.cancel();
    }

    fn task_status(&self) -> Status {
        self.status()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "<non-string payload>"
    }
}

// Resumption is driven by explicit `resume()` calls; wakeups have nowhere
// to go, so the body is polled with a waker that does nothing.
static NOOP_VTABLE: RawWakerVTable = RawWakerVTable::new(noop_clone, noop, noop, noop);

fn noop_clone(_: *const ()) -> RawWaker {
    RawWaker::new(ptr::null(), &NOOP_VTABLE)
}

fn noop(_: *const ()) {}

fn noop_waker() -> Waker {
    // SAFETY: every vtable entry is a no-op and the data pointer is never
    // dereferenced.
    unsafe { Waker::from_raw(RawWaker::new(ptr::null(), &NOOP_VTABLE)) }
}
