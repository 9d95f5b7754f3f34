//! Segmented lock-free work queue.
//!
//! Multi-producer queue with a single (externally serialized) consumer.
//! Storage is a chain of fixed-capacity blocks, newest block at the head.
//! Producers reserve a slot with one CAS on a packed compound state
//! `{head block, write cursor, count, block count}`, then construct the
//! payload into the reserved slot with no further synchronization; the
//! consumer spin-waits on a per-slot `written` flag in case the reservation
//! outran construction. Fully drained trailing blocks are recycled through
//! a lock-free free list instead of being returned to the allocator.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use atomic::Atomic;
use crossbeam::utils::Backoff;


/// Default number of slots per block.
pub const DEFAULT_SLOTS: usize = 64;

/// Fixed-capacity storage segment.
///
/// Slots fill from the highest index downward; `written` flags publish
/// individual slots to the consumer, `written_num` tracks how many slots in
/// this block still hold live payloads.
struct Block<T, const K: usize> {
    slots: [UnsafeCell<MaybeUninit<T>>; K],
    written: [AtomicBool; K],
    written_num: AtomicU32,
    next: AtomicPtr<Block<T, K>>,
}

impl<T, const K: usize> Block<T, K> {
    fn alloc() -> *mut Self {
        Box::into_raw(Box::new(Self {
            slots: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            written: std::array::from_fn(|_| AtomicBool::new(false)),
            written_num: AtomicU32::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// Compound queue state, packed into one `u128` so producers and the
/// consumer synchronize through a single CAS.
///
/// `first` is the index of the most recently reserved slot in the head
/// block, `count` the number of outstanding items across the whole chain,
/// `num_blocks` the chain length (checked in debug builds).
struct State<T, const K: usize> {
    block: *mut Block<T, K>,
    first: u16,
    count: u16,
    num_blocks: u16,
}

// Manual impls: a derive would demand `T: Clone` although only a pointer to
// `T` is stored.
impl<T, const K: usize> Clone for State<T, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, const K: usize> Copy for State<T, K> {}

impl<T, const K: usize> State<T, K> {
    #[inline]
    fn pack(self) -> u128 {
        ((self.block as usize as u128) << 64)
            | ((self.first as u128) << 32)
            | ((self.count as u128) << 16)
            | (self.num_blocks as u128)
    }

    #[inline]
    fn unpack(bits: u128) -> Self {
        Self {
            block: (bits >> 64) as usize as *mut Block<T, K>,
            first: (bits >> 32) as u16,
            count: (bits >> 16) as u16,
            num_blocks: bits as u16,
        }
    }
}

/// Lock-free multi-producer queue with single-consumer pop.
///
/// `enqueue` may be called from any number of threads concurrently. Popping
/// is single-consumer: the safe [`pop`](Self::pop)/[`pop_with`](Self::pop_with)
/// take `&mut self`, and the pool serializes its workers around the
/// `unsafe` shared-reference variants.
///
/// The queue tracks at most `u16::MAX` outstanding items (the packed state
/// keeps 16-bit counters); exceeding that is a reservation-accounting bug
/// and is asserted in debug builds.
pub struct LockFreeQueue<T, const K: usize = DEFAULT_SLOTS> {
    state: Atomic<u128>,
    free_head: AtomicPtr<Block<T, K>>,
    releasing: AtomicBool,
}

unsafe impl<T: Send, const K: usize> Send for LockFreeQueue<T, K> {}
unsafe impl<T: Send, const K: usize> Sync for LockFreeQueue<T, K> {}

impl<T, const K: usize> Default for LockFreeQueue<T, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const K: usize> LockFreeQueue<T, K> {
    /// Create a queue with 3 pre-allocated blocks on the free list.
    pub fn new() -> Self {
        Self::with_blocks(3)
    }

    /// Create a queue, seeding the free list with `initial_blocks` blocks.
    pub fn with_blocks(initial_blocks: u32) -> Self {
        let queue = Self {
            state: Atomic::new(0u128),
            free_head: AtomicPtr::new(ptr::null_mut()),
            releasing: AtomicBool::new(false),
        };
        for _ in 0..initial_blocks {
            queue.move_to_free_list(Block::alloc());
        }
        queue
    }

    /// Number of outstanding items.
    #[inline]
    pub fn num(&self) -> usize {
        State::<T, K>::unpack(self.state.load(Ordering::Relaxed)).count as usize
    }

    /// Whether the queue currently holds no items.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num() == 0
    }

    /// Enqueue an item. Safe for any number of concurrent producers.
    pub fn enqueue(&self, value: T) {
        let (block, idx) = self.prepare_slot();
        // SAFETY: the CAS in `prepare_slot` reserved `idx` exclusively for
        // this producer; nobody else touches the slot until `written` is set.
        unsafe {
            (*(*block).slots[idx].get()).write(value);
            (*block).written_num.fetch_add(1, Ordering::Relaxed);
            let was_set = (*block).written[idx].swap(true, Ordering::Release);
            debug_assert!(!was_set);
        }
    }

    /// Pop the oldest item, if any.
    pub fn pop(&mut self) -> Option<T> {
        // SAFETY: `&mut self` is the single consumer.
        unsafe { self.pop_unsync() }
    }

    /// Pop the oldest item, extracting through `transform` instead of moving
    /// the value out. The payload is destroyed in place afterward; use this
    /// for types that must not relocate.
    pub fn pop_with<U>(&mut self, transform: impl FnOnce(&mut T) -> U) -> Option<U> {
        // SAFETY: `&mut self` is the single consumer.
        unsafe { self.pop_with_unsync(transform) }
    }

    /// Pop through a shared reference.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no other thread is inside any pop
    /// variant at the same time (single logical consumer). Concurrent
    /// producers are fine.
    pub unsafe fn pop_unsync(&self) -> Option<T> {
        // SAFETY: `take_slot` hands out the sole pointer to an initialized
        // slot; reading moves the value out and the slot is not dropped.
        self.take_slot(|slot| unsafe { ptr::read(slot) })
    }

    /// [`pop_with`](Self::pop_with) through a shared reference.
    ///
    /// # Safety
    ///
    /// Same contract as [`pop_unsync`](Self::pop_unsync).
    pub unsafe fn pop_with_unsync<U>(&self, transform: impl FnOnce(&mut T) -> U) -> Option<U> {
        self.take_slot(|slot| {
            // SAFETY: sole pointer to an initialized slot; destroyed in
            // place after the caller extracted what it needs.
            let result = transform(unsafe { &mut *slot });
            unsafe { ptr::drop_in_place(slot) };
            result
        })
    }

    /// Drop every block cached on the free list.
    pub fn drain_free_list(&self) {
        loop {
            let block = self.take_free_block();
            if block.is_null() {
                break;
            }
            // SAFETY: a block popped from the free list is owned by us and
            // holds no payloads.
            unsafe { drop(Box::from_raw(block)) };
        }
    }

    /// Reserve one slot: decrement the cursor in the head block if room
    /// remains, otherwise prepend a fresh block and reserve its last slot.
    fn prepare_slot(&self) -> (*mut Block<T, K>, usize) {
        let mut new_block: *mut Block<T, K> = ptr::null_mut();
        let mut prev = State::<T, K>::unpack(self.state.load(Ordering::Relaxed));
        loop {
            debug_assert!(prev.count < u16::MAX);
            let no_room = prev.first == 0 && prev.count > 0;
            let (block, added) = if no_room || prev.block.is_null() {
                if new_block.is_null() {
                    new_block = self.get_or_alloc_block();
                }
                // SAFETY: `new_block` is exclusively ours until the CAS
                // below publishes it.
                unsafe { (*new_block).next.store(prev.block, Ordering::Relaxed) };
                (new_block, true)
            } else {
                // Allocated a spare on an earlier iteration but no longer
                // need it: hand it back.
                if !new_block.is_null() {
                    unsafe { (*new_block).next.store(ptr::null_mut(), Ordering::Relaxed) };
                    self.move_to_free_list(new_block);
                    new_block = ptr::null_mut();
                }
                (prev.block, false)
            };
            let next = State::<T, K> {
                block,
                first: if prev.first == 0 {
                    (K - 1) as u16
                } else {
                    prev.first - 1
                },
                count: prev.count + 1,
                num_blocks: prev.num_blocks + u16::from(added),
            };
            match self.state.compare_exchange_weak(
                prev.pack(),
                next.pack(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return (next.block, next.first as usize),
                Err(bits) => prev = State::unpack(bits),
            }
        }
    }

    /// Claim one item by decrementing the count; `None` means empty.
    fn try_decrement(&self) -> Option<State<T, K>> {
        let mut prev = State::<T, K>::unpack(self.state.load(Ordering::Relaxed));
        loop {
            if prev.count == 0 {
                return None;
            }
            let mut next = prev;
            next.count -= 1;
            match self.state.compare_exchange_weak(
                prev.pack(),
                next.pack(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    debug_assert!((next.first as usize) < K);
                    return Some(next);
                }
                Err(bits) => prev = State::unpack(bits),
            }
        }
    }

    /// Map the oldest position (`first + count` after the decrement) to its
    /// block and in-block index. Position `p` lives `p / K` links from the
    /// head.
    fn locate(state: &State<T, K>) -> (*mut Block<T, K>, usize) {
        let pos = state.first as usize + state.count as usize;
        debug_assert!(pos < state.num_blocks as usize * K);
        let mut block = state.block;
        for _ in 0..pos / K {
            debug_assert!(!block.is_null());
            // SAFETY: chained blocks stay alive while items remain in them;
            // only the (single) consumer unlinks, and only past the last
            // used position.
            block = unsafe { (*block).next.load(Ordering::Acquire) };
        }
        debug_assert!(!block.is_null());
        (block, pos % K)
    }

    /// Common pop path: claim, locate, wait for the writer, consume, clear.
    unsafe fn take_slot<U>(&self, consume: impl FnOnce(*mut T) -> U) -> Option<U> {
        let state = self.try_decrement()?;
        let (block, idx) = Self::locate(&state);

        // The reservation may have outrun construction: the producer holds
        // the slot but has not finished writing yet.
        let backoff = Backoff::new();
        while !(*block).written[idx].load(Ordering::Acquire) {
            backoff.snooze();
        }

        let result = consume((*(*block).slots[idx].get()).as_mut_ptr());
        self.clear_slot(block, idx);
        Some(result)
    }

    unsafe fn clear_slot(&self, block: *mut Block<T, K>, idx: usize) {
        (*block).written[idx].store(false, Ordering::Release);
        let before = (*block).written_num.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0);
        if before == 1 {
            self.release_empty_blocks();
        }
    }

    /// Return fully drained trailing blocks to the free list.
    fn release_empty_blocks(&self) {
        if self
            .releasing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let state = State::<T, K>::unpack(self.state.load(Ordering::Relaxed));
        if !state.block.is_null() {
            let last_used = state.first as usize + state.count as usize;
            // SAFETY: `releasing` serializes unlinking, and the consumer is
            // the only walker past the head block.
            let removed = unsafe { self.release_chain(last_used, 1, &(*state.block).next) };
            if removed > 0 {
                let mut prev = State::<T, K>::unpack(self.state.load(Ordering::Relaxed));
                loop {
                    let mut next = prev;
                    next.num_blocks -= removed;
                    match self.state.compare_exchange_weak(
                        prev.pack(),
                        next.pack(),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(bits) => prev = State::unpack(bits),
                    }
                }
            }
        }
        self.releasing.store(false, Ordering::Release);
    }

    /// Depth-first walk so the deepest (oldest) blocks are released first;
    /// a block goes back to the free list only when it is the tail, empty,
    /// and sits entirely past the last used position.
    unsafe fn release_chain(
        &self,
        last_used: usize,
        block_idx: usize,
        link: &AtomicPtr<Block<T, K>>,
    ) -> u16 {
        let block = link.load(Ordering::Acquire);
        if block.is_null() {
            return 0;
        }
        let mut removed = self.release_chain(last_used, block_idx + 1, &(*block).next);
        let first_index = block_idx * K;
        if first_index > last_used
            && (*block).next.load(Ordering::Relaxed).is_null()
            && (*block).written_num.load(Ordering::Relaxed) == 0
        {
            link.store(ptr::null_mut(), Ordering::Release);
            self.move_to_free_list(block);
            removed += 1;
        }
        removed
    }

    fn move_to_free_list(&self, block: *mut Block<T, K>) {
        // SAFETY: the block is unlinked and drained, so we own it.
        unsafe {
            debug_assert_eq!((*block).written_num.load(Ordering::Relaxed), 0);
            debug_assert!((*block)
                .written
                .iter()
                .all(|flag| !flag.load(Ordering::Relaxed)));
            let mut head = self.free_head.load(Ordering::Relaxed);
            loop {
                (*block).next.store(head, Ordering::Relaxed);
                match self.free_head.compare_exchange_weak(
                    head,
                    block,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(current) => head = current,
                }
            }
        }
    }

    fn take_free_block(&self) -> *mut Block<T, K> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return ptr::null_mut();
            }
            // SAFETY: free-listed blocks are only deallocated in `Drop` and
            // `drain_free_list`, never while producers race here.
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            match self.free_head.compare_exchange_weak(
                head,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        unsafe {
            (*head).next.store(ptr::null_mut(), Ordering::Relaxed);
            debug_assert_eq!((*head).written_num.load(Ordering::Relaxed), 0);
        }
        head
    }

    fn get_or_alloc_block(&self) -> *mut Block<T, K> {
        let block = self.take_free_block();
        if block.is_null() {
            Block::alloc()
        } else {
            block
        }
    }
}

impl<T, const K: usize> Drop for LockFreeQueue<T, K> {
    fn drop(&mut self) {
        // Unconsumed payloads still own resources: run their destructors
        // before freeing the chain.
        let state = State::<T, K>::unpack(self.state.load(Ordering::Relaxed));
        let mut block = state.block;
        while !block.is_null() {
            unsafe {
                for idx in 0..K {
                    if (*block).written[idx].load(Ordering::Relaxed) {
                        ptr::drop_in_place((*(*block).slots[idx].get()).as_mut_ptr());
                    }
                }
                let next = (*block).next.load(Ordering::Relaxed);
                drop(Box::from_raw(block));
                block = next;
            }
        }
        self.drain_free_list();
    }
}
