//! Inbound envelope queue.
//!
//! A bounded, lock-free single-producer/single-consumer queue. The receive
//! side owns the [`Producer`]; the dispatch thread owns the [`Consumer`] and
//! reads it through [`EnvelopeSource`], the only queue operation the dispatch
//! loop depends on.
//!
//! ```
//! use sgbridge::cancel::CancelToken;
//! use sgbridge::queue::{self, Recv};
//!
//! let (tx, rx) = queue::channel::<u32>(16);
//! tx.push(7).unwrap();
//! assert!(matches!(rx.recv(&CancelToken::new()), Recv::Item(7)));
//! ```

mod ring;

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::envelope::Envelope;
use ring::Ring;

/// Default depth of the inbound queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 4096;

/// Longest sleep between polls of an empty queue; bounds how long a
/// cancellation can go unnoticed.
const MAX_PARK: Duration = Duration::from_millis(1);

/// Marker to opt out of `Sync` while staying `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Result of a blocking receive.
#[derive(Debug, PartialEq, Eq)]
pub enum Recv<T> {
    Item(T),
    /// The cancellation token fired while waiting.
    Cancelled,
    /// The producer is gone and the queue is drained.
    Disconnected,
}

/// Why a push did not enqueue its item. The item is handed back.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum PushError<T> {
    #[error("queue is full")]
    Full(T),
    #[error("consumer disconnected")]
    Disconnected(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Disconnected(item) => item,
        }
    }
}

/// Write end of the queue. `Send`, not `Sync`, not `Clone`.
pub struct Producer<T: Send> {
    ring: Arc<Ring<T>>,
    _unsync: PhantomUnsync,
}

/// Read end of the queue. `Send`, not `Sync`, not `Clone`.
pub struct Consumer<T: Send> {
    ring: Arc<Ring<T>>,
    _unsync: PhantomUnsync,
}

/// Creates a queue holding at most `capacity` items.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn channel<T: Send>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let ring = Arc::new(Ring::with_capacity(capacity));
    (
        Producer {
            ring: Arc::clone(&ring),
            _unsync: PhantomData,
        },
        Consumer {
            ring,
            _unsync: PhantomData,
        },
    )
}

impl<T: Send> Producer<T> {
    /// Pushes without waiting.
    ///
    /// # Errors
    ///
    /// Returns the item inside [`PushError`] if the queue is full or the
    /// consumer has been dropped.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        if self.ring.is_disconnected() {
            return Err(PushError::Disconnected(item));
        }
        // SAFETY: this is the only producer and it is not `Sync`.
        unsafe { self.ring.push(item) }.map_err(PushError::Full)
    }

    /// Pushes, spinning while the queue is full, for at most `timeout`
    /// (forever if `None`).
    ///
    /// # Errors
    ///
    /// Returns the item on timeout or if the consumer has been dropped.
    pub fn push_timeout(&self, mut item: T, timeout: Option<Duration>) -> Result<(), PushError<T>> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut backoff = Backoff::new();
        loop {
            match self.push(item) {
                Ok(()) => return Ok(()),
                Err(PushError::Full(returned)) => {
                    item = returned;
                    if let Some(dl) = deadline
                        && Instant::now() > dl
                    {
                        return Err(PushError::Full(item));
                    }
                    backoff.snooze();
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Whether the consumer has been dropped.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.ring.is_disconnected()
    }
}

impl<T: Send> Drop for Producer<T> {
    fn drop(&mut self) {
        self.ring.disconnect();
    }
}

impl<T: Send> Consumer<T> {
    /// Pops without waiting.
    #[inline]
    #[must_use]
    pub fn try_pop(&self) -> Option<T> {
        // SAFETY: this is the only consumer and it is not `Sync`.
        unsafe { self.ring.pop() }
    }

    /// Waits for the next item.
    ///
    /// Cancellation is checked before every poll, so a cancelled token wins
    /// over queued items. Once the producer is gone the remaining items are
    /// still delivered before [`Recv::Disconnected`].
    pub fn recv(&self, cancel: &CancelToken) -> Recv<T> {
        let mut backoff = Backoff::new();
        loop {
            if cancel.is_cancelled() {
                return Recv::Cancelled;
            }
            if let Some(item) = self.try_pop() {
                return Recv::Item(item);
            }
            if self.ring.is_disconnected() {
                // The producer may have pushed right before it went away.
                return self.try_pop().map_or(Recv::Disconnected, Recv::Item);
            }
            backoff.snooze();
        }
    }

    /// Approximate number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.ring.disconnect();
    }
}

/// Where the dispatch loop takes envelopes from.
pub trait EnvelopeSource {
    /// Blocks until an envelope is available, `cancel` fires, or no more
    /// envelopes can arrive.
    fn recv(&mut self, cancel: &CancelToken) -> Recv<Envelope>;
}

impl EnvelopeSource for Consumer<Envelope> {
    fn recv(&mut self, cancel: &CancelToken) -> Recv<Envelope> {
        Consumer::recv(self, cancel)
    }
}

/// Spin, then yield, then sleep with doubling intervals up to [`MAX_PARK`].
struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;

    const fn new() -> Self {
        Self { step: 0 }
    }

    fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1 << self.step) {
                std::hint::spin_loop();
            }
        } else if self.step <= Self::YIELD_LIMIT {
            thread::yield_now();
        } else {
            let exp = (self.step - Self::YIELD_LIMIT).min(5);
            let sleep = Duration::from_micros(32 << exp).min(MAX_PARK);
            thread::sleep(sleep);
        }
        self.step = self.step.saturating_add(1);
    }
}
