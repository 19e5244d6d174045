//! The guts. Wait queues, fences, buffers, reservation batches.

pub mod batch;
pub mod buffer;
pub mod fence;
pub mod metrics;
pub mod seqno;
pub mod waitq;

pub use batch::{Intent, ReserveError, ValidateEntry};
pub use buffer::{
    reserve_lock, ticket_older, BufferObject, FenceSlots, ReserveGuard, MAX_SHARED_FENCE,
};
pub use fence::{Fence, FenceCallback, FenceDriver, FenceError, WaitError};
pub use metrics::{MetricsSnapshot, SyncMetrics, SYNC_METRICS};
pub use seqno::SeqnoCells;
pub use waitq::{Interrupt, WaitQueue};
