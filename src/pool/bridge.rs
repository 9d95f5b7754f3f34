//! Async bridge: cancellation-safe offload of a callable onto the pool.
//!
//! An offloaded call has two halves. The *requester* lives with whoever
//! awaits the result ([`AsyncCall`], or the `co.offload` adapter inside a
//! task). The *record* is the queue item a worker picks up. The two point
//! at each other while the call is pending; every mutation that needs both
//! halves consistent (pickup, delivery, cancellation, detach-on-drop) runs
//! under the two-party lock in [`super::pair`], so either side can go away
//! at any moment without the other dereferencing freed memory.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use super::pair::{lock_pair, PairLock, PairSide};
use super::ThreadPool;

/// Lifecycle of an offloaded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncStatus {
    /// Enqueued; no worker has picked it up yet.
    Requested,
    /// A worker is running the callable.
    Executing,
    /// The callable finished; the result (if any) is consumable.
    Done,
    /// Withdrawn before any worker picked it up.
    Canceled,
}

impl AsyncStatus {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => AsyncStatus::Executing,
            2 => AsyncStatus::Done,
            3 => AsyncStatus::Canceled,
            _ => AsyncStatus::Requested,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            AsyncStatus::Requested => 0,
            AsyncStatus::Executing => 1,
            AsyncStatus::Done => 2,
            AsyncStatus::Canceled => 3,
        }
    }

    /// Whether the call reached a final state.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, AsyncStatus::Done | AsyncStatus::Canceled)
    }
}

pub(crate) type Job = Box<dyn FnOnce(&Record) + Send>;

/// Queue-side half of an offloaded call. Boxed so its address stays stable
/// while the queue moves the item around.
pub(crate) struct Record {
    lock: PairLock,
    peer: AtomicPtr<Requester>,
    job: Mutex<Option<Job>>,
}

impl PairSide for Record {
    #[inline]
    fn pair_lock(&self) -> &PairLock {
        &self.lock
    }
}

impl Record {
    fn new() -> Box<Self> {
        Box::new(Self {
            lock: PairLock::new(),
            peer: AtomicPtr::new(ptr::null_mut()),
            job: Mutex::new(None),
        })
    }

    /// Worker pickup: mark the requester `Executing` and hand out the
    /// callable. Returns `None` when the requester already detached or
    /// withdrew the callable, in which case the item is skipped.
    pub(crate) fn forward_job(&self) -> Option<Job> {
        let guard = lock_pair(self, &self.peer)?;
        let job = self.job.lock().take();
        if job.is_some() {
            guard
                .peer()
                .status
                .store(AsyncStatus::Executing.as_u8(), Ordering::Release);
        }
        job
    }
}

impl Drop for Record {
    fn drop(&mut self) {
        // A record dropped while still linked (queue torn down before any
        // worker reached it) must not leave the requester pointing at freed
        // memory.
        if let Some(guard) = lock_pair(self, &self.peer) {
            guard.peer().peer.store(ptr::null_mut(), Ordering::Release);
            self.peer.store(ptr::null_mut(), Ordering::Release);
            drop(guard);
            trace!("offload record dropped while pending");
        }
    }
}

/// Requester-side half: status machine plus the link back to the record.
pub(crate) struct Requester {
    lock: PairLock,
    status: AtomicU8,
    peer: AtomicPtr<Record>,
}

impl PairSide for Requester {
    #[inline]
    fn pair_lock(&self) -> &PairLock {
        &self.lock
    }
}

struct Shared<R> {
    head: Requester,
    result: Mutex<Option<R>>,
}

/// Handle to a callable offloaded onto a [`ThreadPool`].
///
/// Dropping the handle detaches from the pending call: a not-yet-started
/// callable is withdrawn, a running one finishes on the worker and its
/// result is discarded. Either way no memory is shared afterwards.
pub struct AsyncCall<R> {
    shared: Arc<Shared<R>>,
}

impl<R: Send + 'static> AsyncCall<R> {
    /// Enqueue `f` for execution on `pool`. The call starts in
    /// [`AsyncStatus::Requested`].
    pub fn spawn<F>(pool: &ThreadPool, f: F) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
    {
        let shared = Arc::new(Shared {
            head: Requester {
                lock: PairLock::new(),
                status: AtomicU8::new(AsyncStatus::Requested.as_u8()),
                peer: AtomicPtr::new(ptr::null_mut()),
            },
            result: Mutex::new(None),
        });

        let record = Record::new();
        let record_ptr = &*record as *const Record as *mut Record;
        let head_ptr = &shared.head as *const Requester as *mut Requester;

        // Cross-link both halves before the record becomes visible to
        // workers.
        shared.head.peer.store(record_ptr, Ordering::Release);
        record.peer.store(head_ptr, Ordering::Release);

        let delivery = Arc::clone(&shared);
        *record.job.lock() = Some(Box::new(move |rec: &Record| {
            let outcome = catch_unwind(AssertUnwindSafe(f));
            if outcome.is_err() {
                warn!("offloaded callable panicked; reporting an empty result");
            }
            // Deliver under the pair lock; if the requester detached while
            // we were executing, the result is simply dropped.
            if let Some(guard) = lock_pair(rec, &rec.peer) {
                debug_assert!(ptr::eq(guard.peer(), &delivery.head));
                if let Ok(value) = outcome {
                    *delivery.result.lock() = Some(value);
                }
                guard
                    .peer()
                    .status
                    .store(AsyncStatus::Done.as_u8(), Ordering::Release);
                // Unlink both sides together; the pair is finished.
                guard.peer().peer.store(ptr::null_mut(), Ordering::Release);
                rec.peer.store(ptr::null_mut(), Ordering::Release);
            } else {
                trace!("requester detached mid-execution; result dropped");
            }
        }));

        pool.submit(record);
        Self { shared }
    }

    /// Current lifecycle state.
    #[inline]
    pub fn status(&self) -> AsyncStatus {
        AsyncStatus::from_u8(self.shared.head.status.load(Ordering::Acquire))
    }

    /// Whether the call reached `Done` or `Canceled`.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Withdraw the callable before any worker starts it.
    ///
    /// Succeeds only while the record still holds the callable; once a
    /// worker picked it up this is a no-op returning `false` and the call
    /// will still reach [`AsyncStatus::Done`].
    pub fn try_cancel(&self) -> bool {
        let head = &self.shared.head;
        let Some(guard) = lock_pair(head, &head.peer) else {
            return false;
        };
        let job = guard.peer().job.lock().take();
        if job.is_none() {
            // Handed off already; execution cannot be recalled.
            return false;
        }
        head.status
            .store(AsyncStatus::Canceled.as_u8(), Ordering::Release);
        guard.peer().peer.store(ptr::null_mut(), Ordering::Release);
        head.peer.store(ptr::null_mut(), Ordering::Release);
        drop(guard);
        trace!("offloaded callable withdrawn before pickup");
        true
    }

    /// Return-and-clear the result. `None` until the call is `Done`, and
    /// `None` again after the value was consumed once.
    pub fn consume(&self) -> Option<R> {
        if self.status() != AsyncStatus::Done {
            return None;
        }
        self.shared.result.lock().take()
    }

    /// Readiness predicate for the task layer: true once the call reached a
    /// terminal state.
    pub(crate) fn readiness(&self) -> Box<dyn FnMut() -> bool + Send> {
        let shared = Arc::clone(&self.shared);
        Box::new(move || AsyncStatus::from_u8(shared.head.status.load(Ordering::Acquire)).is_terminal())
    }
}

impl<R> Drop for AsyncCall<R> {
    fn drop(&mut self) {
        let head = &self.shared.head;
        // Detach while the pair is still linked. `lock_pair` spins through
        // the short windows in which a worker holds the record's flag
        // (pickup or delivery), so this blocks at most briefly.
        if let Some(guard) = lock_pair(head, &head.peer) {
            let withdrawn = guard.peer().job.lock().take();
            if withdrawn.is_some() {
                head.status
                    .store(AsyncStatus::Canceled.as_u8(), Ordering::Release);
            }
            guard.peer().peer.store(ptr::null_mut(), Ordering::Release);
            head.peer.store(ptr::null_mut(), Ordering::Release);
        }
    }
}

impl<R> fmt::Debug for AsyncCall<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCall")
            .field(
                "status",
                &AsyncStatus::from_u8(self.shared.head.status.load(Ordering::Acquire)),
            )
            .finish()
    }
}
