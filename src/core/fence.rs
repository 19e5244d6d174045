//! Fences. Single-shot completion objects that cross from unsignaled to
//! signaled exactly once, with signaling kept lazy until somebody asks.
//!
//! The enable-signaling protocol is the delicate part: the variant hook may
//! be expensive (arming an interrupt source, inserting commands into an
//! engine's stream) and may take locks of its own, so it always runs with
//! the fence lock dropped. Whoever sets `NEED_SW_SIGNAL` first owns the one
//! permitted invocation; everyone else just queues behind it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::metrics::SYNC_METRICS;
use super::seqno::{SeqnoCells, SeqnoState};
use super::waitq::{Interrupt, WaitQueue, WakeTarget};

/// The variant's `enable_signaling` hook has been invoked.
const NEED_SW_SIGNAL: u32 = 1 << 0;
/// Terminal state. Monotonic; never cleared.
const SIGNALED: u32 = 1 << 1;

/// Fence operation failed. Check the variant for why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FenceError {
    /// Fence already crossed into its terminal state.
    AlreadySignaled = 1,
}

/// A blocking wait ended without the fence signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// Cancelled by the interrupt token; carries the unconsumed budget.
    Interrupted(Duration),
    /// Budget exhausted before the fence signaled.
    Timeout,
}

/// Dispatch table for externally-implemented fence variants.
///
/// `enable_signaling` arranges for [`Fence::signal`] to eventually be
/// called once software notification is needed; returning false means the
/// fence already completed (or arming failed) and the core signals it on
/// the spot. A hook that returns true should keep the fence alive until it
/// has signaled, typically by holding a clone of the `Arc` that is dropped
/// from `release`.
pub trait FenceDriver: Send + Sync {
    fn enable_signaling(&self, fence: &Fence) -> bool;

    /// Optional completion peek for [`Fence::is_signaled`].
    fn signaled(&self, _fence: &Fence) -> Option<bool> {
        None
    }

    /// Optional destruction hook.
    fn release(&self, _fence: &Fence) {}
}

pub(crate) enum FenceKind {
    /// CPU-only; signaling is always explicit, the enable hook never runs.
    Software,
    /// Completion tracked by a timeline cell crossing a target.
    Seqno(SeqnoState),
    /// Caller-supplied dispatch table.
    External(Arc<dyn FenceDriver>),
}

type CallbackList = Vec<Arc<FenceCallback>>;

/// Single-shot synchronization object.
///
/// Shared as `Arc<Fence>`; the creator keeps a clone until it has called
/// [`signal`](Fence::signal), and anyone blocking or registering a
/// callback holds one for the duration.
pub struct Fence {
    flags: AtomicU32,
    queue: Arc<WaitQueue<CallbackList>>,
    kind: FenceKind,
    payload: u64,
}

impl Fence {
    fn with_flags(kind: FenceKind, payload: u64, flags: u32) -> Arc<Self> {
        Arc::new(Self {
            flags: AtomicU32::new(flags),
            queue: Arc::new(WaitQueue::new(Vec::new())),
            kind,
            payload,
        })
    }

    /// Software-only fence. Completion can only come from
    /// [`Fence::signal`], so the enable hook is marked as already run.
    pub fn new_software(payload: u64) -> Arc<Self> {
        Self::with_flags(FenceKind::Software, payload, NEED_SW_SIGNAL)
    }

    /// Fence completed by `cells[offset]` reaching `target`, in wrapping
    /// 32-bit order. Holds the cells alive until destruction; software
    /// signaling stays available as a fallback.
    pub fn new_seqno(cells: &Arc<SeqnoCells>, offset: usize, target: u32, payload: u64) -> Arc<Self> {
        let state = SeqnoState::new(Arc::clone(cells), offset, target);
        Self::with_flags(FenceKind::Seqno(state), payload, 0)
    }

    /// Fence backed by an external dispatch table.
    pub fn with_driver(driver: Arc<dyn FenceDriver>, payload: u64) -> Arc<Self> {
        Self::with_flags(FenceKind::External(driver), payload, 0)
    }

    #[inline(always)]
    pub fn payload(&self) -> u64 {
        self.payload
    }

    /// Timeline parameters if this is a sequence-number fence.
    #[inline]
    pub fn seqno_target(&self) -> Option<(usize, u32)> {
        match &self.kind {
            FenceKind::Seqno(s) => Some((s.offset, s.target)),
            _ => None,
        }
    }

    /// The dispatch table of an externally-implemented fence. Variants
    /// identify their own fences by pointer identity on this handle.
    #[inline]
    pub fn driver(&self) -> Option<&Arc<dyn FenceDriver>> {
        match &self.kind {
            FenceKind::External(driver) => Some(driver),
            _ => None,
        }
    }

    #[inline(always)]
    fn flag_set(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    /// Whether the fence has reached its terminal state.
    ///
    /// Consults the variant's completion peek when the flag is still
    /// clear, latching the result. Without a peek this only ever returns
    /// true once signaling has been enabled and delivered.
    pub fn is_signaled(&self) -> bool {
        if self.flag_set(SIGNALED) {
            return true;
        }
        if self.peek() == Some(true) {
            let _ = self.signal();
            return true;
        }
        false
    }

    fn peek(&self) -> Option<bool> {
        match &self.kind {
            FenceKind::Software => None,
            FenceKind::Seqno(s) => Some(s.passed()),
            FenceKind::External(driver) => driver.signaled(self),
        }
    }

    fn dispatch_enable(&self) -> bool {
        match &self.kind {
            // NEED_SW_SIGNAL is preset at creation; this is unreachable.
            FenceKind::Software => true,
            FenceKind::Seqno(s) => !s.passed(),
            FenceKind::External(driver) => driver.enable_signaling(self),
        }
    }

    /// Signal completion. Idempotent in effect: the first call wakes every
    /// waiter and runs every registered callback exactly once; later calls
    /// return [`FenceError::AlreadySignaled`] without touching state.
    pub fn signal(&self) -> Result<(), FenceError> {
        let mut queue = self.queue.lock();
        if self.flag_set(SIGNALED) {
            SYNC_METRICS.record_redundant_signal();
            return Err(FenceError::AlreadySignaled);
        }
        self.flags.fetch_or(SIGNALED, Ordering::Release);
        let fired = std::mem::take(&mut *queue);
        self.queue.broadcast_locked(&queue);
        drop(queue);

        SYNC_METRICS.record_signal();
        for cb in fired {
            cb.fire();
        }
        Ok(())
    }

    /// Run the enable-signaling protocol now instead of at the first wait.
    ///
    /// The hook is invoked at most once over the fence's lifetime, with
    /// the fence lock dropped; if it reports failure the fence is signaled
    /// immediately.
    pub fn enable_sw_signaling(&self) {
        let queue = self.queue.lock();
        if self.flags.load(Ordering::Acquire) & (SIGNALED | NEED_SW_SIGNAL) == 0 {
            self.flags.fetch_or(NEED_SW_SIGNAL, Ordering::Release);
            drop(queue);
            if !self.dispatch_enable() {
                let _ = self.signal();
            }
        }
    }

    /// Register `cb` to run when the fence signals.
    ///
    /// Ensures signaling is enabled first. If the fence is already
    /// signaled the callback is not queued and not invoked; the caller
    /// gets [`FenceError::AlreadySignaled`] and may run it synchronously.
    ///
    /// Callbacks run on the signaling thread with the fence lock dropped;
    /// they must be short, non-blocking, and must not re-enter this
    /// fence's registration API.
    ///
    /// Panics if `cb` is still queued on a fence.
    pub fn add_callback(&self, cb: &Arc<FenceCallback>) -> Result<(), FenceError> {
        assert!(
            !cb.queued.swap(true, Ordering::AcqRel),
            "fence callback registered while already queued"
        );

        let mut queue = self.queue.lock();
        if self.flags.load(Ordering::Acquire) & (SIGNALED | NEED_SW_SIGNAL) == 0 {
            self.flags.fetch_or(NEED_SW_SIGNAL, Ordering::Release);
            // Drop the lock: the hook may take a lock that a signaler holds
            // while calling signal(), and that pairing must not invert.
            drop(queue);
            if !self.dispatch_enable() {
                let _ = self.signal();
            }
            queue = self.queue.lock();
        }

        if self.flag_set(SIGNALED) {
            cb.queued.store(false, Ordering::Release);
            return Err(FenceError::AlreadySignaled);
        }
        queue.push(Arc::clone(cb));
        Ok(())
    }

    /// Unregister a callback. Returns true iff it was still queued, in
    /// which case it will not fire. After signaling this returns false
    /// and makes no claim about whether the callback has finished running.
    pub fn remove_callback(&self, cb: &Arc<FenceCallback>) -> bool {
        let mut queue = self.queue.lock();
        if self.flag_set(SIGNALED) {
            return false;
        }
        match queue.iter().position(|queued| Arc::ptr_eq(queued, cb)) {
            Some(pos) => {
                queue.remove(pos);
                cb.queued.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Block until the fence signals. With an interrupt token, returns
    /// [`WaitError::Interrupted`] when the token trips.
    pub fn wait(&self, intr: Option<&Interrupt>) -> Result<(), WaitError> {
        self.wait_inner(intr, None).map(|_| ())
    }

    /// Block up to `timeout`. Success returns the unconsumed budget;
    /// expiry returns [`WaitError::Timeout`]; interruption preserves the
    /// residue so callers can tell cancellation from expiry.
    pub fn wait_timeout(&self, intr: Option<&Interrupt>, timeout: Duration) -> Result<Duration, WaitError> {
        self.wait_inner(intr, Some(timeout))
    }

    fn wait_inner(&self, intr: Option<&Interrupt>, timeout: Option<Duration>) -> Result<Duration, WaitError> {
        SYNC_METRICS.record_wait();
        let _watch = intr.map(|i| i.watch(Arc::clone(&self.queue) as Arc<dyn WakeTarget>));
        // A budget too large to ever expire degrades to an untimed wait.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        let mut queue = self.queue.lock();

        if self.flag_set(SIGNALED) {
            return Ok(remaining(deadline));
        }
        // An already-pending interrupt returns before signaling is armed.
        if let Some(intr) = intr {
            if intr.is_tripped() {
                SYNC_METRICS.record_wait_interrupt();
                return Err(WaitError::Interrupted(remaining(deadline)));
            }
        }

        if self.flags.load(Ordering::Acquire) & NEED_SW_SIGNAL == 0 {
            self.flags.fetch_or(NEED_SW_SIGNAL, Ordering::Release);
            drop(queue);
            if !self.dispatch_enable() {
                let _ = self.signal();
            }
            queue = self.queue.lock();
        }

        loop {
            if self.flag_set(SIGNALED) {
                return Ok(remaining(deadline));
            }
            if let Some(intr) = intr {
                if intr.is_tripped() {
                    SYNC_METRICS.record_wait_interrupt();
                    return Err(WaitError::Interrupted(remaining(deadline)));
                }
            }
            match deadline {
                None => queue = self.queue.sleep(queue),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        SYNC_METRICS.record_wait_timeout();
                        return Err(WaitError::Timeout);
                    }
                    queue = self.queue.sleep_timeout(queue, deadline - now);
                }
            }
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        debug_assert!(
            self.queue.lock().is_empty(),
            "fence dropped with callbacks still queued"
        );
        if let FenceKind::External(driver) = &self.kind {
            let driver = Arc::clone(driver);
            driver.release(self);
        }
    }
}

#[inline]
fn remaining(deadline: Option<Instant>) -> Duration {
    match deadline {
        None => Duration::MAX,
        Some(deadline) => deadline.saturating_duration_since(Instant::now()),
    }
}

/// One-shot hook run when its fence signals.
///
/// The Rust rendition of a wait-queue entry carrying a function pointer
/// and a private pointer: the closure owns whatever context it needs.
/// A callback can be queued on at most one fence at a time.
pub struct FenceCallback {
    hook: Box<dyn Fn() + Send + Sync>,
    queued: AtomicBool,
}

impl FenceCallback {
    pub fn new(hook: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            hook: Box::new(hook),
            queued: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    fn fire(&self) {
        self.queued.store(false, Ordering::Release);
        (self.hook)();
        SYNC_METRICS.record_callback();
    }
}
