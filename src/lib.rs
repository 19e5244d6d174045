//! # Holdfast
//!
//! An asynchronous fence and reservation substrate for handing shared
//! buffers between execution engines that must never block each other's
//! command streams.
//!
//! ## Core Philosophy
//!
//! Completion is a one-way fact: a fence crosses from unsignaled to
//! signaled exactly once, and everything downstream hangs off that edge.
//! Expensive signaling machinery stays off until somebody actually needs
//! to be told. Multi-buffer acquisition never deadlocks: contention is
//! settled by ticket age, and the oldest batch always wins.
//!
//! ## Primary API Surface
//!
//! - [`Fence`] - Single-shot completion object with lazy signaling
//! - [`SeqnoCells`] - Shared timeline memory for hardware-style fences
//! - [`BufferObject`] - Per-buffer reservation state and fence slots
//! - [`ValidateEntry`] - One buffer's slot in a reservation batch
//! - [`core::batch`] - `reserve` / `back_off` / `wait` / `commit`
//! - [`Interrupt`] - Trip-once cancellation token for blocking waits
//!
//! ## Design Constraints
//!
//! - **Bounded inline state**: fence sets are fixed-size arrays, no
//!   allocation on the reserve or commit paths beyond `Arc` traffic
//! - **One reservation lock**, held only to mutate state, never across a
//!   variant hook or a blocking wait
//! - **Wrapping 32-bit tickets** compared in signed arithmetic, so 2³²
//!   reservations later an old ticket is still old
//!
//! ## Example
//!
//! ```rust
//! use holdfast::prelude::*;
//! use std::sync::Arc;
//!
//! // A producer takes exclusive hold of a buffer and publishes the fence
//! // for the work it is about to submit.
//! let buf = Arc::new(BufferObject::new());
//! let entries = [ValidateEntry::new(Arc::clone(&buf), Intent::Exclusive)];
//!
//! batch::reserve(&entries, None).unwrap();
//! let fence = Fence::new_software(0);
//! batch::commit(&entries, &fence);
//!
//! // A consumer reserving the same buffer collects that fence and waits
//! // for it before its own work may run.
//! let entries = [ValidateEntry::new(Arc::clone(&buf), Intent::Exclusive)];
//! batch::reserve(&entries, None).unwrap();
//! assert_eq!(entries[0].fence_count(), 1);
//!
//! fence.signal().unwrap();
//! batch::wait(&entries, None).unwrap();
//! batch::back_off(&entries);
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

pub mod core;

/// Prelude for convenient imports of primary API types.
pub mod prelude {
    pub use crate::core::batch::{self, Intent, ReserveError, ValidateEntry};
    pub use crate::core::buffer::{BufferObject, FenceSlots, MAX_SHARED_FENCE};
    pub use crate::core::fence::{Fence, FenceCallback, FenceDriver, FenceError, WaitError};
    pub use crate::core::seqno::SeqnoCells;
    pub use crate::core::waitq::Interrupt;
}

// Re-export primary types at crate root for convenience.
pub use crate::core::batch::{Intent, ReserveError, ValidateEntry};
pub use crate::core::buffer::{BufferObject, FenceSlots, MAX_SHARED_FENCE};
pub use crate::core::fence::{Fence, FenceCallback, FenceDriver, FenceError, WaitError};
pub use crate::core::metrics::{MetricsSnapshot, SyncMetrics, SYNC_METRICS};
pub use crate::core::seqno::SeqnoCells;
pub use crate::core::waitq::{Interrupt, WaitQueue};
