//! Reservation batches: take exclusive hold of an ordered set of buffers
//! in whatever order the caller chose, snapshot the fences guarding them,
//! and after the work is queued swap in the fence that represents it.
//!
//! Deadlock breaking is wound-or-wait on a wrapping 32-bit ticket: the
//! batch that drew the smaller ticket never backs off, so some batch
//! always makes progress no matter how the buffer sets overlap.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arrayvec::ArrayVec;

use super::buffer::{
    next_ticket, reserve_lock, BufferObject, ReserveConflict, ReserveGuard, MAX_SHARED_FENCE,
};
use super::fence::{Fence, FenceCallback, WaitError};
use super::metrics::SYNC_METRICS;
use super::waitq::{recover, Interrupt};

/// Reservation of a whole batch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReserveError {
    /// A contention wait was cancelled by the interrupt token.
    Interrupted = 1,
    /// Shared-intent entry against a buffer already holding
    /// [`MAX_SHARED_FENCE`] shared fences; one more would not fit at
    /// commit.
    SharedCapacity = 2,
}

/// What the batch wants from a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Intent {
    /// Coexists with other shared holders; only the prior exclusive
    /// fence gates this work.
    Shared = 0,
    /// Sole access; every prior fence gates this work.
    Exclusive = 1,
}

type FenceSet = ArrayVec<Arc<Fence>, MAX_SHARED_FENCE>;
type WaitSet = ArrayVec<(Arc<Fence>, Arc<FenceCallback>), MAX_SHARED_FENCE>;

/// One buffer's slot in a batch: the buffer, the caller's intent, and —
/// between a successful [`reserve`] and [`commit`] or [`back_off`] — the
/// fences that were guarding it.
///
/// The reference count is a join counter for the deferred-completion
/// pattern, not a liveness count (`Arc` handles liveness):
/// [`queue_waits`](ValidateEntry::queue_waits) takes one reference per
/// registered callback and each firing callback puts one back.
pub struct ValidateEntry {
    buffer: Arc<BufferObject>,
    intent: Intent,
    reserved: AtomicBool,
    collected: Mutex<FenceSet>,
    refs: AtomicU32,
    waits: Mutex<WaitSet>,
}

impl ValidateEntry {
    /// New entry with a join count of one, held by the creator.
    pub fn new(buffer: Arc<BufferObject>, intent: Intent) -> Arc<Self> {
        Arc::new(Self {
            buffer,
            intent,
            reserved: AtomicBool::new(false),
            collected: Mutex::new(ArrayVec::new()),
            refs: AtomicU32::new(1),
            waits: Mutex::new(ArrayVec::new()),
        })
    }

    #[inline(always)]
    pub fn buffer(&self) -> &Arc<BufferObject> {
        &self.buffer
    }

    #[inline(always)]
    pub fn intent(&self) -> Intent {
        self.intent
    }

    #[inline(always)]
    pub fn is_reserved(&self) -> bool {
        self.reserved.load(Ordering::Acquire)
    }

    /// Fences collected by the last successful [`reserve`].
    pub fn collected_fences(&self) -> FenceSet {
        recover(self.collected.lock()).clone()
    }

    #[inline]
    pub fn fence_count(&self) -> usize {
        recover(self.collected.lock()).len()
    }

    fn collected(&self) -> MutexGuard<'_, FenceSet> {
        recover(self.collected.lock())
    }

    /// Bump the join counter; returns the new count.
    #[inline]
    pub fn validate_get(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one join reference. Returns true when the count reached zero,
    /// at which point the callback slots are cleared; what happens next is
    /// the caller's policy.
    pub fn validate_put(&self) -> bool {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "validate_put on a drained entry");
        if prev == 1 {
            recover(self.waits.lock()).clear();
            true
        } else {
            false
        }
    }

    /// Outstanding join references.
    #[inline(always)]
    pub fn pending(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Register a countdown callback on every collected fence: each one
    /// takes a join reference and puts it back when its fence signals.
    /// Already-fired fences put theirs back immediately. Returns how many
    /// callbacks were actually queued.
    pub fn queue_waits(this: &Arc<Self>) -> u32 {
        debug_assert!(recover(this.waits.lock()).is_empty(), "waits already queued");
        let fences = this.collected_fences();
        let mut queued = 0;

        for fence in fences {
            this.validate_get();
            let entry = Arc::clone(this);
            let cb = FenceCallback::new(move || {
                entry.validate_put();
            });
            match fence.add_callback(&cb) {
                Ok(()) => {
                    recover(this.waits.lock()).push((fence, cb));
                    queued += 1;
                }
                Err(_) => {
                    this.validate_put();
                }
            }
        }
        queued
    }

    /// Cancel callbacks queued by [`queue_waits`](ValidateEntry::queue_waits),
    /// putting back the join reference of each one that had not fired yet.
    pub fn cancel_waits(&self) {
        let waits: WaitSet = {
            let mut slots = recover(self.waits.lock());
            slots.drain(..).collect()
        };
        for (fence, cb) in waits {
            if fence.remove_callback(&cb) {
                self.validate_put();
            }
        }
    }
}

fn back_off_locked(list: &[Arc<ValidateEntry>], guard: &ReserveGuard) {
    for entry in list {
        if entry.reserved.swap(false, Ordering::AcqRel) {
            entry.collected().clear();
            entry.buffer.unreserve(guard);
        }
    }
}

#[inline]
fn interrupted(err: WaitError) -> ReserveError {
    debug_assert!(matches!(err, WaitError::Interrupted(_)));
    ReserveError::Interrupted
}

/// Atomically reserve every buffer in `list`, in list order, and snapshot
/// the fences guarding each one.
///
/// Entries may name the same buffer more than once; the later occurrences
/// are no-ops. Contention against concurrent batches is resolved
/// internally by ticket order and never surfaced: the side with the newer
/// ticket releases everything it holds, waits for the contested buffer,
/// and starts over with a fresh ticket.
///
/// On success every entry is reserved and its collected fences are the
/// complete prior fence set for exclusive intent, or at most the prior
/// exclusive fence for shared intent. On any error nothing stays
/// reserved.
pub fn reserve(list: &[Arc<ValidateEntry>], intr: Option<&Interrupt>) -> Result<(), ReserveError> {
    if list.is_empty() {
        return Ok(());
    }
    for entry in list {
        entry.reserved.store(false, Ordering::Release);
        entry.collected().clear();
    }
    SYNC_METRICS.record_reserve();

    'batch: loop {
        let mut guard = reserve_lock();
        let ticket = next_ticket(&guard);

        for entry in list {
            let bo = entry.buffer();
            loop {
                match bo.try_reserve(&guard, ticket) {
                    Ok(()) => break,
                    Err(ReserveConflict::Busy) => {
                        // Holder drew a newer ticket and will yield.
                        SYNC_METRICS.record_contention();
                        drop(guard);
                        if let Err(err) = bo.wait_unreserved(intr) {
                            let cleanup = reserve_lock();
                            back_off_locked(list, &cleanup);
                            return Err(interrupted(err));
                        }
                        guard = reserve_lock();
                    }
                    Err(ReserveConflict::Backoff) => {
                        // Holder is older and will not yield for us.
                        SYNC_METRICS.record_restart();
                        back_off_locked(list, &guard);
                        drop(guard);
                        if let Err(err) = bo.wait_unreserved(intr) {
                            return Err(interrupted(err));
                        }
                        continue 'batch;
                    }
                }
            }
            entry.reserved.store(true, Ordering::Release);

            let slots = bo.slots(&guard);
            if entry.intent == Intent::Shared && slots.shared.is_full() {
                back_off_locked(list, &guard);
                return Err(ReserveError::SharedCapacity);
            }

            let mut collected = entry.collected();
            if entry.intent == Intent::Exclusive && !slots.shared.is_empty() {
                for fence in &slots.shared {
                    collected.push(Arc::clone(fence));
                }
            } else if let Some(excl) = &slots.excl {
                collected.push(Arc::clone(excl));
            }
        }
        return Ok(());
    }
}

/// Cancel a reservation between [`reserve`] and [`commit`]. Every still-
/// reserved entry is released and its waiters woken; collected fences are
/// dropped.
pub fn back_off(list: &[Arc<ValidateEntry>]) {
    if list.is_empty() {
        return;
    }
    let guard = reserve_lock();
    back_off_locked(list, &guard);
    SYNC_METRICS.record_back_off();
}

/// Block until every collected fence in the list has signaled.
pub fn wait(list: &[Arc<ValidateEntry>], intr: Option<&Interrupt>) -> Result<(), WaitError> {
    for entry in list {
        for fence in entry.collected_fences() {
            fence.wait(intr)?;
        }
    }
    Ok(())
}

/// Like [`wait`], with one time budget threaded across every fence in
/// sequence. Success returns whatever budget is left.
pub fn wait_timeout(
    list: &[Arc<ValidateEntry>],
    intr: Option<&Interrupt>,
    timeout: Duration,
) -> Result<Duration, WaitError> {
    let mut remaining = timeout;
    for entry in list {
        for fence in entry.collected_fences() {
            remaining = fence.wait_timeout(intr, remaining)?;
        }
    }
    Ok(remaining)
}

/// Commit a reservation with the fence for the work about to run.
///
/// Exclusive entries retire every fence previously attached to their
/// buffer; shared entries leave the prior set in place. The new fence is
/// then installed (exclusive slot, or appended to the shared set), the
/// buffer released, and its waiters woken. Retired fences are dropped
/// only after the reservation lock is released, since dropping the last
/// reference runs variant release hooks.
///
/// Panics if an entry was not reserved: committing without a reservation
/// would corrupt another batch's hold.
pub fn commit(list: &[Arc<ValidateEntry>], fence: &Arc<Fence>) {
    if list.is_empty() {
        return;
    }
    let mut retired: Vec<Arc<Fence>> = Vec::new();
    {
        let mut guard = reserve_lock();

        for entry in list {
            assert!(
                entry.reserved.swap(false, Ordering::AcqRel),
                "commit on an entry that was never reserved"
            );
        }

        for entry in list.iter().filter(|e| e.intent == Intent::Exclusive) {
            let slots = entry.buffer.slots_mut(&mut guard);
            retired.extend(slots.shared.drain(..));
            if let Some(old) = slots.excl.take() {
                retired.push(old);
            }
        }

        for entry in list {
            let slots = entry.buffer.slots_mut(&mut guard);
            match entry.intent {
                Intent::Shared => {
                    // reserve() checked capacity per entry; a batch naming
                    // one buffer twice with shared intent can still fill
                    // the last slot. The overflowing install is skipped,
                    // the buffer is released regardless.
                    let _ = slots.shared.try_push(Arc::clone(fence));
                }
                Intent::Exclusive => {
                    if let Some(old) = slots.excl.replace(Arc::clone(fence)) {
                        retired.push(old);
                    }
                }
            }
            entry.buffer.unreserve(&guard);
        }
        SYNC_METRICS.record_commit();
    }
    drop(retired);
}
