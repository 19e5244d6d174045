//! Lightweight metrics. No allocations, no locks, just atomics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters for the fence and reservation paths.
pub static SYNC_METRICS: SyncMetrics = SyncMetrics::new();

/// Substrate metrics. All counters are monotonic.
#[derive(Debug)]
pub struct SyncMetrics {
    pub signals: AtomicU64,
    pub redundant_signals: AtomicU64,
    pub callbacks_fired: AtomicU64,
    pub waits: AtomicU64,
    pub wait_timeouts: AtomicU64,
    pub wait_interrupts: AtomicU64,
    pub reserves: AtomicU64,
    pub contentions: AtomicU64,
    pub restarts: AtomicU64,
    pub back_offs: AtomicU64,
    pub commits: AtomicU64,
}

impl SyncMetrics {
    pub const fn new() -> Self {
        Self {
            signals: AtomicU64::new(0),
            redundant_signals: AtomicU64::new(0),
            callbacks_fired: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            wait_timeouts: AtomicU64::new(0),
            wait_interrupts: AtomicU64::new(0),
            reserves: AtomicU64::new(0),
            contentions: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            back_offs: AtomicU64::new(0),
            commits: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub fn record_signal(&self) {
        self.signals.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_redundant_signal(&self) {
        self.redundant_signals.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_callback(&self) {
        self.callbacks_fired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_wait(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_wait_timeout(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_wait_interrupt(&self) {
        self.wait_interrupts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_reserve(&self) {
        self.reserves.fetch_add(1, Ordering::Relaxed);
    }

    /// A reserve parked behind a newer-ticket holder.
    #[inline(always)]
    pub fn record_contention(&self) {
        self.contentions.fetch_add(1, Ordering::Relaxed);
    }

    /// A reserve lost the ticket comparison and restarted from scratch.
    #[inline(always)]
    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// An explicit cancellation between reserve and commit.
    #[inline(always)]
    pub fn record_back_off(&self) {
        self.back_offs.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            signals: self.signals.load(Ordering::Relaxed),
            redundant_signals: self.redundant_signals.load(Ordering::Relaxed),
            callbacks_fired: self.callbacks_fired.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            wait_interrupts: self.wait_interrupts.load(Ordering::Relaxed),
            reserves: self.reserves.load(Ordering::Relaxed),
            contentions: self.contentions.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            back_offs: self.back_offs.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
        }
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub signals: u64,
    pub redundant_signals: u64,
    pub callbacks_fired: u64,
    pub waits: u64,
    pub wait_timeouts: u64,
    pub wait_interrupts: u64,
    pub reserves: u64,
    pub contentions: u64,
    pub restarts: u64,
    pub back_offs: u64,
    pub commits: u64,
}
