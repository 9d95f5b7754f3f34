//! Task combinators: compose cancellation policies around an inner task
//! without touching its body.

use super::co::Co;
use super::handle::UniqueTask;
use super::Status;

/// Wrap `inner` so that `cond` is checked before every resume step.
///
/// While `cond` stays false the wrapper resumes the inner task, forwards
/// any yielded value outward immediately, and completes with the inner
/// task's return value once it is `Done`. When `cond` turns true the inner
/// task is released and the wrapper completes with `None`. An inner task
/// that ends canceled or faulted also completes the wrapper with `None`.
pub fn break_if<R, Y, F>(inner: UniqueTask<R, Y>, mut cond: F) -> UniqueTask<Option<R>, Y>
where
    R: Send + 'static,
    Y: Send + 'static,
    F: FnMut() -> bool + Send + 'static,
{
    UniqueTask::new(move |co: Co<Y>| async move {
        loop {
            if cond() {
                drop(inner);
                return None;
            }
            inner.resume();
            let forwarded = match inner.consume_yield() {
                Some(value) => {
                    co.yield_value(value).await;
                    true
                }
                None => false,
            };
            match inner.status() {
                Status::Done => return inner.consume(),
                Status::Suspended => {
                    // A forwarded yield already suspended this cycle.
                    if !forwarded {
                        co.suspend().await;
                    }
                }
                _ => return None,
            }
        }
    })
}

/// Like [`break_if`], but a true `cond` cancels the inner task and then
/// cancels the wrapper itself: the wrapper ends `Canceled`, not `Done`.
pub fn cancel_if<R, Y, F>(inner: UniqueTask<R, Y>, mut cond: F) -> UniqueTask<Option<R>, Y>
where
    R: Send + 'static,
    Y: Send + 'static,
    F: FnMut() -> bool + Send + 'static,
{
    UniqueTask::new(move |co: Co<Y>| async move {
        loop {
            if cond() {
                inner.cancel();
                co.cancel_self().await;
                // A canceled body is never polled again.
                return None;
            }
            inner.resume();
            let forwarded = match inner.consume_yield() {
                Some(value) => {
                    co.yield_value(value).await;
                    true
                }
                None => false,
            };
            match inner.status() {
                Status::Done => return inner.consume(),
                Status::Suspended => {
                    if !forwarded {
                        co.suspend().await;
                    }
                }
                _ => return None,
            }
        }
    })
}

/// A task that completes once `pred` returns true, checked on every
/// resume.
pub fn wait_until<F>(pred: F) -> UniqueTask<(), ()>
where
    F: FnMut() -> bool + Send + 'static,
{
    UniqueTask::new(move |co| async move {
        co.until(pred).await;
    })
}
