//! Two-party lock for cross-referencing peer records.
//!
//! The async bridge links two pinned-in-memory records that point at each
//! other while an offloaded call is pending. Either side may detach at any
//! moment, so any mutation that must observe both halves consistently runs
//! under this protocol:
//!
//! 1. acquire your own flag (spin until held);
//! 2. re-check the peer pointer; `null` means the pair is already detached:
//!    release your flag and fail;
//! 3. *try* to acquire the peer's flag; on failure release your own flag and
//!    restart from step 1. Never hold one side while blocking on the other.
//!
//! Unlock releases both sides together. While a side holds its own flag the
//! peer cannot finish an unlink (an unlink needs both flags), so a non-null
//! peer pointer read under the own flag is safe to dereference.

use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crossbeam::utils::Backoff;

/// One side's exclusive-access flag.
pub(crate) struct PairLock {
    locked: AtomicBool,
}

impl PairLock {
    pub(crate) const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn acquire(&self) {
        let backoff = Backoff::new();
        while !self.try_acquire() {
            backoff.snooze();
        }
    }

    #[inline]
    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// A record participating in a cross-referenced pair.
pub(crate) trait PairSide {
    fn pair_lock(&self) -> &PairLock;
}

/// Both flags held; dropping releases them together.
pub(crate) struct PairGuard<'a, P: PairSide> {
    own: &'a PairLock,
    peer: *mut P,
}

impl<P: PairSide> PairGuard<'_, P> {
    /// The peer record. Valid for the lifetime of the guard: unlinking (and
    /// therefore freeing) the peer requires both flags, which we hold.
    #[inline]
    pub(crate) fn peer(&self) -> &P {
        unsafe { &*self.peer }
    }
}

impl<P: PairSide> Drop for PairGuard<'_, P> {
    fn drop(&mut self) {
        self.peer().pair_lock().release();
        self.own.release();
    }
}

/// Run the two-party protocol from `own`'s side.
///
/// Returns a guard holding both flags, or `None` if the pair is detached.
/// Spins while the peer's flag is transiently held elsewhere, which bounds
/// the blocking window to the short critical sections of this module's
/// callers.
pub(crate) fn lock_pair<'a, O, P>(own: &'a O, peer_link: &AtomicPtr<P>) -> Option<PairGuard<'a, P>>
where
    O: PairSide,
    P: PairSide,
{
    let backoff = Backoff::new();
    loop {
        own.pair_lock().acquire();
        let peer = peer_link.load(Ordering::Acquire);
        if peer.is_null() {
            own.pair_lock().release();
            return None;
        }
        // SAFETY: our own flag is held, so the peer cannot complete an
        // unlink, and a linked peer is never freed before unlinking.
        if unsafe { (*peer).pair_lock() }.try_acquire() {
            return Some(PairGuard {
                own: own.pair_lock(),
                peer,
            });
        }
        own.pair_lock().release();
        backoff.snooze();
    }
}
