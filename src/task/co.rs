//! Suspension scope handed to computation bodies.
//!
//! A computation receives a [`Co`] when it is created and may only suspend
//! through the adapters below: the five suspension kinds plus yielding and
//! self-cancellation. Every adapter cooperates with the
//! promise's resume loop: it either suspends unconditionally for one
//! resume cycle or registers the single pending wait (predicate or nested
//! task) that gates the next resume.
//!
//! Foreign futures awaited through [`Co::external`] are polled with a
//! no-op waker: their wakeups are ignored and readiness is re-checked on
//! every resume, which is the runtime's polling model. Awaiting a foreign
//! future directly inside the body behaves identically.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;

use super::handle::{SharedTask, UniqueTask};
use super::promise::{CoreState, DynTask, Promise};
use super::Status;
use crate::pool::{AsyncCall, ThreadPool};

/// Handle into the running computation's continuation state.
///
/// Cheap to clone; usable only from inside the computation it was created
/// for.
///
/// ```
/// use coflow::UniqueTask;
///
/// let task: UniqueTask<(), u32> = UniqueTask::new(|co| async move {
///     for i in 0..3 {
///         co.yield_value(i).await;
///     }
/// });
///
/// task.resume();
/// assert_eq!(task.consume_yield(), Some(0));
/// ```
pub struct Co<Y = ()> {
    core: Arc<CoreState>,
    yielded: Arc<Mutex<Option<Y>>>,
}

impl<Y> Clone for Co<Y> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            yielded: Arc::clone(&self.yielded),
        }
    }
}

impl<Y> Co<Y>
where
    Y: Send + 'static,
{
    pub(crate) fn new(core: Arc<CoreState>, yielded: Arc<Mutex<Option<Y>>>) -> Self {
        Self { core, yielded }
    }

    /// Suspend unconditionally for one resume cycle.
    pub fn suspend(&self) -> Suspend {
        Suspend { polled: false }
    }

    /// Produce a value into the yield slot, then suspend for one cycle.
    /// The driver picks the value up with `consume_yield()` between
    /// resumes.
    pub fn yield_value(&self, value: Y) -> YieldValue<Y> {
        YieldValue {
            slot: Arc::clone(&self.yielded),
            value: Some(value),
        }
    }

    /// Suspend until `pred` returns true. The predicate is evaluated once
    /// immediately (true → no suspension at all) and then re-evaluated on
    /// every subsequent `resume()`.
    pub fn until<F>(&self, pred: F) -> Until<F>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Until {
            core: Arc::clone(&self.core),
            pred: Some(pred),
        }
    }

    /// Await a nested task. The outer computation resumes only once the
    /// inner task leaves `Suspended`; its return value (if it completed)
    /// becomes the awaited result, and the inner task is released
    /// afterwards.
    pub fn join<R2, Y2>(&self, task: UniqueTask<R2, Y2>) -> Join<R2, Y2>
    where
        R2: Send + 'static,
        Y2: Send + 'static,
    {
        Join {
            inner: task.into_promise(),
            core: Arc::clone(&self.core),
            started: false,
        }
    }

    /// [`join`](Self::join) for a shared handle.
    pub fn join_shared<R2, Y2>(&self, task: SharedTask<R2, Y2>) -> Join<R2, Y2>
    where
        R2: Send + 'static,
        Y2: Send + 'static,
    {
        Join {
            inner: task.into_promise(),
            core: Arc::clone(&self.core),
            started: false,
        }
    }

    /// Await a foreign future, polling it for readiness once per resume.
    pub fn external<F>(&self, fut: F) -> External<F>
    where
        F: Future + Send,
    {
        External { fut }
    }

    /// Offload `f` to the worker pool and suspend until the worker
    /// finished. Produces `Some(result)`, or `None` if the call was
    /// withdrawn or the callable panicked on the worker.
    ///
    /// Dropping the computation mid-offload detaches from the pending call
    /// safely (see [`AsyncCall`]).
    pub fn offload<T, F>(&self, pool: &ThreadPool, f: F) -> Offload<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        Offload {
            call: Some(AsyncCall::spawn(pool, f)),
            core: Arc::clone(&self.core),
            registered: false,
        }
    }

    /// Cancel the running computation from the inside and suspend. The
    /// status becomes `Canceled` and the body is never polled again, so
    /// this await never completes.
    pub fn cancel_self(&self) -> CancelSelf {
        CancelSelf {
            core: Arc::clone(&self.core),
        }
    }
}

/// One-cycle unconditional suspension. See [`Co::suspend`].
pub struct Suspend {
    polled: bool,
}

impl Unpin for Suspend {}

impl Future for Suspend {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.polled {
            Poll::Ready(())
        } else {
            this.polled = true;
            Poll::Pending
        }
    }
}

/// Yield-then-suspend. See [`Co::yield_value`].
pub struct YieldValue<Y> {
    slot: Arc<Mutex<Option<Y>>>,
    value: Option<Y>,
}

impl<Y> Unpin for YieldValue<Y> {}

impl<Y> Future for YieldValue<Y> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match this.value.take() {
            Some(value) => {
                *this.slot.lock() = Some(value);
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}

/// Predicate suspension. See [`Co::until`].
pub struct Until<F> {
    core: Arc<CoreState>,
    pred: Option<F>,
}

impl<F> Unpin for Until<F> {}

impl<F> Future for Until<F>
where
    F: FnMut() -> bool + Send + 'static,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match this.pred.take() {
            Some(mut pred) => {
                if pred() {
                    return Poll::Ready(());
                }
                this.core.set_ready(Box::new(pred));
                Poll::Pending
            }
            // Re-polled only after the registered predicate passed during
            // a resume.
            None => Poll::Ready(()),
        }
    }
}

/// Nested-task suspension. See [`Co::join`].
pub struct Join<R2, Y2> {
    inner: Option<Arc<Promise<R2, Y2>>>,
    core: Arc<CoreState>,
    started: bool,
}

impl<R2, Y2> Unpin for Join<R2, Y2> {}

impl<R2, Y2> Future for Join<R2, Y2>
where
    R2: Send + 'static,
    Y2: Send + 'static,
{
    type Output = Option<R2>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<R2>> {
        let this = self.get_mut();
        let Some(promise) = this.inner.as_ref() else {
            // A detached handle was awaited; nothing to wait for.
            return Poll::Ready(None);
        };

        if !this.started {
            this.started = true;
            if promise.status() == Status::Suspended {
                promise.resume();
                if promise.status() == Status::Suspended {
                    this.core
                        .set_child(Arc::clone(promise) as Arc<dyn DynTask>);
                    return Poll::Pending;
                }
            }
        }

        let result = promise.take_return();
        this.inner = None;
        Poll::Ready(result)
    }
}

/// Foreign-future suspension. See [`Co::external`].
pub struct External<F> {
    fut: F,
}

impl<F> Future for External<F>
where
    F: Future + Send,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        // SAFETY: structural projection; `fut` is pinned whenever `self` is.
        unsafe { self.map_unchecked_mut(|this| &mut this.fut) }.poll(cx)
    }
}

/// Pool-offload suspension. See [`Co::offload`].
pub struct Offload<T> {
    call: Option<AsyncCall<T>>,
    core: Arc<CoreState>,
    registered: bool,
}

impl<T> Unpin for Offload<T> {}

impl<T> Future for Offload<T>
where
    T: Send + 'static,
{
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        let Some(call) = this.call.as_ref() else {
            return Poll::Ready(None);
        };

        if !call.is_finished() && !this.registered {
            this.registered = true;
            this.core.set_ready(call.readiness());
            return Poll::Pending;
        }

        let result = call.consume();
        this.call = None;
        Poll::Ready(result)
    }
}

/// Self-cancellation. See [`Co::cancel_self`].
pub struct CancelSelf {
    core: Arc<CoreState>,
}

impl Unpin for CancelSelf {}

impl Future for CancelSelf {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        self.core.cancel();
        Poll::Pending
    }
}
