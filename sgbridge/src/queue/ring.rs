//! Lock-free SPSC ring buffer.
//!
//! # Safety
//!
//! [`Ring::push`] and [`Ring::pop`] are unsafe because the caller must uphold
//! the SPSC invariant: exactly one producer and one consumer, neither role
//! used from two threads at once. The safe wrappers in [`super`] enforce it by
//! making each endpoint `Send` but not `Sync` or `Clone`.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// One side's published index plus its private copy of the other side's.
#[repr(C)]
#[repr(align(64))]
struct Side {
    /// Published index; written by the owning side, read by the other.
    index: AtomicUsize,
    /// Last observed value of the opposite index. Owning side only.
    cached: UnsafeCell<usize>,
}

impl Side {
    const fn new() -> Self {
        Self {
            index: AtomicUsize::new(0),
            cached: UnsafeCell::new(0),
        }
    }
}

/// Bounded ring with monotonically increasing head/tail counters.
///
/// Slots in `[tail, head)` hold initialized values. Indices wrap with
/// `wrapping_add`, so `head - tail` is always the number of queued items.
pub(super) struct Ring<T> {
    /// `index` is the head: next slot to write.
    producer: Side,
    /// `index` is the tail: next slot to read.
    consumer: Side,
    /// Set when either endpoint is dropped.
    disconnected: AtomicBool,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: values move between threads through the ring, hence `T: Send`.
unsafe impl<T: Send> Send for Ring<T> {}

// SAFETY: each slot is accessed by one side at a time: the producer writes
// only slots outside `[tail, head)` and the consumer reads only slots inside
// it. Release stores of head/tail paired with Acquire loads on the other side
// order the slot accesses. The `cached` cells are touched by their owner only.
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    pub(super) fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be greater than 0");
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Self {
            producer: Side::new(),
            consumer: Side::new(),
            disconnected: AtomicBool::new(false),
            slots,
        }
    }

    #[inline]
    pub(super) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot(&self, index: usize) -> *mut MaybeUninit<T> {
        self.slots[index % self.slots.len()].get()
    }

    /// Number of queued items as seen from any thread. Approximate while the
    /// other side is active.
    pub(super) fn len(&self) -> usize {
        let head = self.producer.index.load(Ordering::Acquire);
        let tail = self.consumer.index.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    pub(super) fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    pub(super) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Pushes `item`, or hands it back if the ring is full.
    ///
    /// # Safety
    ///
    /// Only the single producer may call this.
    #[inline]
    pub(super) unsafe fn push(&self, item: T) -> Result<(), T> {
        let head = self.producer.index.load(Ordering::Relaxed);

        // SAFETY: `cached` on the producer side belongs to the producer.
        let cached_tail = unsafe { &mut *self.producer.cached.get() };
        if head.wrapping_sub(*cached_tail) >= self.capacity() {
            *cached_tail = self.consumer.index.load(Ordering::Acquire);
            if head.wrapping_sub(*cached_tail) >= self.capacity() {
                return Err(item);
            }
        }

        // SAFETY: `head - tail < capacity`, so the slot at `head` is outside
        // `[tail, head)` and the consumer is not reading it.
        unsafe { self.slot(head).write(MaybeUninit::new(item)) };

        self.producer
            .index
            .store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Pops the oldest item, if any.
    ///
    /// # Safety
    ///
    /// Only the single consumer may call this.
    #[inline]
    pub(super) unsafe fn pop(&self) -> Option<T> {
        let tail = self.consumer.index.load(Ordering::Relaxed);

        // SAFETY: `cached` on the consumer side belongs to the consumer.
        let cached_head = unsafe { &mut *self.consumer.cached.get() };
        if *cached_head == tail {
            *cached_head = self.producer.index.load(Ordering::Acquire);
            if *cached_head == tail {
                return None;
            }
        }

        // SAFETY: `tail != head`, so the slot at `tail` was initialized by the
        // producer and published by its Release store of head.
        let item = unsafe { self.slot(tail).read().assume_init() };

        self.consumer
            .index
            .store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let head = *self.producer.index.get_mut();
        let mut tail = *self.consumer.index.get_mut();
        while tail != head {
            let len = self.slots.len();
            // SAFETY: `&mut self` means no endpoint is alive, and every slot
            // in `[tail, head)` holds an initialized value.
            unsafe { self.slots[tail % len].get_mut().assume_init_drop() };
            tail = tail.wrapping_add(1);
        }
    }
}
