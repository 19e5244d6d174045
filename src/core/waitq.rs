//! Wait queues. One mutex guards the state and its condvar; wakeups are
//! always broadcast so flag mutations and wakeups stay atomic to each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, LockResult, Mutex, MutexGuard, Weak};
use std::time::Duration;

/// Unwrap a lock result, recovering the guard if a holder panicked.
#[inline]
pub(crate) fn recover<T>(result: LockResult<T>) -> T {
    match result {
        Ok(v) => v,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Anything an [`Interrupt`] can kick awake.
pub(crate) trait WakeTarget: Send + Sync {
    fn wake_all(&self);
}

/// A state word fused with the condition variable its waiters sleep on.
///
/// Callers hold the guard while checking their predicate and go to sleep
/// through [`sleep`](WaitQueue::sleep); wakers either broadcast while
/// holding the guard or through [`broadcast`](WaitQueue::broadcast), which
/// takes the lock first so a waiter between its predicate check and its
/// sleep cannot miss the notification.
pub struct WaitQueue<T> {
    state: Mutex<T>,
    cond: Condvar,
}

impl<T> WaitQueue<T> {
    pub const fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            cond: Condvar::new(),
        }
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        recover(self.state.lock())
    }

    /// Wake every waiter. Serializes against sleepers via the state lock.
    pub fn broadcast(&self) {
        drop(self.lock());
        self.cond.notify_all();
    }

    /// Wake every waiter while the caller already holds the guard.
    #[inline]
    pub fn broadcast_locked(&self, _guard: &MutexGuard<'_, T>) {
        self.cond.notify_all();
    }

    /// Sleep until the next broadcast. Spurious wakeups are possible;
    /// callers recheck their predicate in a loop.
    #[inline]
    pub fn sleep<'a>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        recover(self.cond.wait(guard))
    }

    /// Sleep until the next broadcast or until `timeout` elapses.
    #[inline]
    pub fn sleep_timeout<'a>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> MutexGuard<'a, T> {
        recover(self.cond.wait_timeout(guard, timeout)).0
    }
}

impl<T: Send + 'static> WakeTarget for WaitQueue<T> {
    fn wake_all(&self) {
        self.broadcast();
    }
}

/// Trip-once cancellation token for blocking waits.
///
/// The userspace stand-in for a thread-directed signal: a wait passes the
/// token down, the token remembers which queues are being slept on, and
/// [`trip`](Interrupt::trip) wakes them all. Once tripped it stays
/// tripped; every wait carrying the token returns interrupted from then on.
pub struct Interrupt {
    tripped: AtomicBool,
    watched: Mutex<Vec<Weak<dyn WakeTarget>>>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self {
            tripped: AtomicBool::new(false),
            watched: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Trip the token and wake every watched queue.
    pub fn trip(&self) {
        self.tripped.store(true, Ordering::Release);
        let targets = recover(self.watched.lock()).clone();
        for target in targets {
            if let Some(target) = target.upgrade() {
                target.wake_all();
            }
        }
    }

    /// Register a queue for wakeup on trip. Dropping the returned guard
    /// unregisters it.
    pub(crate) fn watch(&self, target: Arc<dyn WakeTarget>) -> Watch<'_> {
        let weak = Arc::downgrade(&target);
        recover(self.watched.lock()).push(weak.clone());
        Watch { intr: self, weak }
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct Watch<'a> {
    intr: &'a Interrupt,
    weak: Weak<dyn WakeTarget>,
}

impl Drop for Watch<'_> {
    fn drop(&mut self) {
        let mut watched = recover(self.intr.watched.lock());
        if let Some(pos) = watched.iter().position(|w| Weak::ptr_eq(w, &self.weak)) {
            watched.swap_remove(pos);
        }
    }
}
