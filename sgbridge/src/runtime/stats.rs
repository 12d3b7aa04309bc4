//! Worker counters.
//!
//! Written only by the dispatch thread with relaxed atomics. Readers on other
//! threads get eventually-consistent values, good for telemetry and nothing
//! else.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Counters and the running flag of one dispatch thread.
#[derive(Debug, Default)]
pub struct WorkerStats {
    sent: AtomicU64,
    decode_errors: AtomicU64,
    would_block: AtomicU64,
    refused: AtomicU64,
    empty_bodies: AtomicU64,
    running: AtomicBool,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Payloads accepted by the socket.
    pub sent: u64,
    /// Envelopes that failed to decode.
    pub decode_errors: u64,
    /// Sends that hit a full socket buffer.
    pub would_block: u64,
    /// Sends with no peer listening.
    pub refused: u64,
    /// Envelopes that decoded to no payload.
    pub empty_bodies: u64,
}

impl WorkerStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_would_block(&self) {
        self.would_block.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_refused(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_empty_body(&self) {
        self.empty_bodies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Whether the dispatch loop is live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            would_block: self.would_block.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            empty_bodies: self.empty_bodies.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sent={} decode_errors={} would_block={} refused={} empty={}",
            self.sent, self.decode_errors, self.would_block, self.refused, self.empty_bodies
        )
    }
}
