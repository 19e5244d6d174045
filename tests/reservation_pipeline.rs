//! End-to-end handoff pipeline: a producer publishes work on a pair of
//! buffers, a consumer picks them up, waits out the producer's fence
//! through the callback-driven join counter, and publishes its own.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use holdfast::prelude::*;

fn entries(buffers: &[&Arc<BufferObject>], intent: Intent) -> Vec<Arc<ValidateEntry>> {
    buffers
        .iter()
        .map(|bo| ValidateEntry::new(Arc::clone(bo), intent))
        .collect()
}

/// Spin until the join counter drains or the deadline passes.
fn drain_within(entry: &ValidateEntry, deadline: Duration) -> bool {
    let start = Instant::now();
    while entry.pending() != 0 {
        if start.elapsed() > deadline {
            return false;
        }
        thread::yield_now();
    }
    true
}

#[test]
fn test_producer_consumer_handoff() {
    let front = Arc::new(BufferObject::new());
    let back = Arc::new(BufferObject::new());

    // Producer: exclusive hold on both buffers, nothing to wait for.
    let batch1 = entries(&[&front, &back], Intent::Exclusive);
    batch::reserve(&batch1, None).unwrap();
    assert!(batch1.iter().all(|e| e.fence_count() == 0));

    let produced = Fence::new_software(1);
    batch::commit(&batch1, &produced);

    // Consumer: collects the producer's fence on each buffer.
    let batch2 = entries(&[&front, &back], Intent::Exclusive);
    batch::reserve(&batch2, None).unwrap();
    for entry in &batch2 {
        let collected = entry.collected_fences();
        assert_eq!(collected.len(), 1);
        assert!(Arc::ptr_eq(&collected[0], &produced));
    }

    // The producer's engine finishes while the consumer is waiting.
    let signaler = {
        let produced = Arc::clone(&produced);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            produced.signal().unwrap()
        })
    };

    let remaining = batch::wait_timeout(&batch2, None, Duration::from_secs(10)).unwrap();
    assert!(remaining < Duration::from_secs(10));
    signaler.join().unwrap();

    let consumed = Fence::new_software(2);
    batch::commit(&batch2, &consumed);
    consumed.signal().unwrap();

    assert!(!front.is_reserved());
    assert!(!back.is_reserved());
}

#[test]
fn test_deferred_completion_join_counter() {
    let bo = Arc::new(BufferObject::new());

    // Two producers leave shared fences behind.
    let f1 = Fence::new_software(1);
    let f2 = Fence::new_software(2);
    for fence in [&f1, &f2] {
        let shared = entries(&[&bo], Intent::Shared);
        batch::reserve(&shared, None).unwrap();
        batch::commit(&shared, fence);
    }

    // Consumer registers callbacks instead of blocking.
    let excl = entries(&[&bo], Intent::Exclusive);
    batch::reserve(&excl, None).unwrap();
    let entry = Arc::clone(&excl[0]);
    assert_eq!(ValidateEntry::queue_waits(&entry), 2);

    let own = Fence::new_software(3);
    batch::commit(&excl, &own);

    // Creator drops its own reference; the callbacks hold the rest.
    assert!(!entry.validate_put());
    assert_eq!(entry.pending(), 2);

    let signalers: Vec<_> = [f1, f2]
        .into_iter()
        .map(|fence| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                fence.signal().unwrap()
            })
        })
        .collect();
    for signaler in signalers {
        signaler.join().unwrap();
    }

    assert!(drain_within(&entry, Duration::from_secs(5)));
    own.signal().unwrap();
}

#[test]
fn test_shared_holders_accumulate_then_exclusive_retires() {
    let bo = Arc::new(BufferObject::new());

    let mut shared_fences = Vec::new();
    for seq in 0..3u64 {
        let fence = Fence::new_software(seq);
        let shared = entries(&[&bo], Intent::Shared);
        batch::reserve(&shared, None).unwrap();
        // Shared holders only ever wait on an exclusive fence.
        assert_eq!(shared[0].fence_count(), 0);
        batch::commit(&shared, &fence);
        shared_fences.push(fence);
    }

    let excl = entries(&[&bo], Intent::Exclusive);
    batch::reserve(&excl, None).unwrap();
    assert_eq!(excl[0].fence_count(), 3);

    let own = Fence::new_software(9);
    batch::commit(&excl, &own);
    drop(excl);

    // The shared fences were retired from the buffer at commit.
    for fence in &shared_fences {
        assert_eq!(Arc::strong_count(fence), 1);
    }

    // And the next reservation sees only the new exclusive fence.
    let next = entries(&[&bo], Intent::Shared);
    batch::reserve(&next, None).unwrap();
    let collected = next[0].collected_fences();
    assert_eq!(collected.len(), 1);
    assert!(Arc::ptr_eq(&collected[0], &own));
    batch::back_off(&next);

    own.signal().unwrap();
}

#[test]
fn test_seqno_fences_in_pipeline() {
    let cells = SeqnoCells::new(1);
    let bo = Arc::new(BufferObject::new());

    // Producer's work completes when the timeline reaches 10.
    let produced = Fence::new_seqno(&cells, 0, 10, 0);
    let batch1 = entries(&[&bo], Intent::Exclusive);
    batch::reserve(&batch1, None).unwrap();
    batch::commit(&batch1, &produced);

    let batch2 = entries(&[&bo], Intent::Exclusive);
    batch::reserve(&batch2, None).unwrap();
    assert_eq!(batch2[0].fence_count(), 1);

    let engine = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        cells.write(0, 10);
    });

    // A polling observer, the way an engine without interrupts would
    // watch the timeline.
    let waiter = {
        let fence = Arc::clone(&produced);
        thread::spawn(move || {
            while !fence.is_signaled() {
                thread::yield_now();
            }
        })
    };

    engine.join().unwrap();
    waiter.join().unwrap();

    assert!(produced.is_signaled());
    batch::wait(&batch2, None).unwrap();
    batch::back_off(&batch2);
}
