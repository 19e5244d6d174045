//! Buffer objects and the reservation lock. A buffer carries the ticket
//! that currently owns it, an event queue broadcast on every release, and
//! the fences guarding its contents. All fence-slot mutation is serialized
//! by one process-wide lock, held only long enough to update state.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arrayvec::ArrayVec;

use super::fence::{Fence, WaitError};
use super::waitq::{recover, Interrupt, WaitQueue, WakeTarget};

/// Bound on concurrent shared fences per buffer. Keeps the fence set an
/// inline array.
pub const MAX_SHARED_FENCE: usize = 8;

static RESERVE_LOCK: Mutex<()> = Mutex::new(());
static RESERVE_SEQ: AtomicU32 = AtomicU32::new(0);

/// Proof of holding the process-wide reservation lock. Fence slots are
/// only reachable through it. Never hold one across an `enable_signaling`
/// hook or a blocking wait.
pub struct ReserveGuard {
    _guard: MutexGuard<'static, ()>,
}

/// Take the process-wide reservation lock.
pub fn reserve_lock() -> ReserveGuard {
    ReserveGuard {
        _guard: recover(RESERVE_LOCK.lock()),
    }
}

/// Draw a fresh batch ticket. Wrapping 32-bit; 0 means "free" and is
/// skipped.
pub(crate) fn next_ticket(_guard: &ReserveGuard) -> u32 {
    loop {
        let ticket = RESERVE_SEQ.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if ticket != 0 {
            return ticket;
        }
    }
}

/// Whether ticket `a` was drawn before ticket `b`, in signed wrapping
/// order: an older ticket whose value has wrapped still compares older.
#[inline(always)]
pub fn ticket_older(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

/// Why a locked reservation attempt did not take the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ReserveConflict {
    /// Holder drew a newer ticket; it will back off, wait for the buffer.
    Busy = 1,
    /// Holder drew an older ticket; release everything and start over.
    Backoff = 2,
}

/// Fences currently guarding a buffer: at most one exclusive, plus a
/// bounded set of shared ones.
pub struct FenceSlots {
    pub excl: Option<Arc<Fence>>,
    pub shared: ArrayVec<Arc<Fence>, MAX_SHARED_FENCE>,
}

/// Reservation state block for one shared buffer.
///
/// The payload the buffer fronts is none of this module's business; the
/// core consumes exactly the ownership word, the event queue, and the
/// fence slots.
pub struct BufferObject {
    reserved: AtomicU32,
    queue: Arc<WaitQueue<()>>,
    waiters: AtomicUsize,
    slots: UnsafeCell<FenceSlots>,
}

// The slots cell is only reached through a ReserveGuard (one process-wide
// lock) or &mut self, so cross-thread access is serialized.
unsafe impl Send for BufferObject {}
unsafe impl Sync for BufferObject {}

impl BufferObject {
    pub fn new() -> Self {
        Self {
            reserved: AtomicU32::new(0),
            queue: Arc::new(WaitQueue::new(())),
            waiters: AtomicUsize::new(0),
            slots: UnsafeCell::new(FenceSlots {
                excl: None,
                shared: ArrayVec::new(),
            }),
        }
    }

    /// Whether any thread is parked on the event queue.
    #[inline]
    pub fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::Acquire) != 0
    }

    #[inline(always)]
    pub fn is_reserved(&self) -> bool {
        self.reserved.load(Ordering::Acquire) != 0
    }

    /// Ticket of the owning batch, 0 when free.
    #[inline(always)]
    pub fn owner_ticket(&self) -> u32 {
        self.reserved.load(Ordering::Acquire)
    }

    #[inline]
    pub fn slots<'a>(&'a self, _guard: &'a ReserveGuard) -> &'a FenceSlots {
        unsafe { &*self.slots.get() }
    }

    #[inline]
    pub fn slots_mut<'a>(&'a self, _guard: &'a mut ReserveGuard) -> &'a mut FenceSlots {
        unsafe { &mut *self.slots.get() }
    }

    /// Try to take the buffer for `ticket`. Re-entrant for the owning
    /// ticket, so a batch naming the same buffer twice succeeds.
    pub(crate) fn try_reserve(&self, _guard: &ReserveGuard, ticket: u32) -> Result<(), ReserveConflict> {
        match self
            .reserved
            .compare_exchange(0, ticket, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(holder) if holder == ticket => Ok(()),
            Err(holder) if ticket_older(holder, ticket) => Err(ReserveConflict::Backoff),
            Err(_) => Err(ReserveConflict::Busy),
        }
    }

    /// Release the buffer and wake everyone parked on it.
    pub(crate) fn unreserve(&self, _guard: &ReserveGuard) {
        self.reserved.store(0, Ordering::Release);
        self.queue.broadcast();
    }

    /// Block until the buffer is free. Must be called without the
    /// reservation lock held.
    pub fn wait_unreserved(&self, intr: Option<&Interrupt>) -> Result<(), WaitError> {
        let _watch = intr.map(|i| i.watch(Arc::clone(&self.queue) as Arc<dyn WakeTarget>));
        let mut guard = self.queue.lock();
        self.waiters.fetch_add(1, Ordering::AcqRel);
        let result = loop {
            if !self.is_reserved() {
                break Ok(());
            }
            if let Some(intr) = intr {
                if intr.is_tripped() {
                    break Err(WaitError::Interrupted(Duration::MAX));
                }
            }
            guard = self.queue.sleep(guard);
        };
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        drop(guard);
        result
    }
}

impl Default for BufferObject {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        debug_assert!(!self.is_reserved(), "buffer dropped while reserved");
        debug_assert!(
            !self.has_waiters(),
            "buffer dropped with waiters parked on its event queue"
        );
    }
}
