//! Property-based tests for the wrapping-ticket order and the bounded
//! shared fence set.
//!
//! These pin down the arithmetic the deadlock breaker depends on: the
//! signed 32-bit comparison must keep calling an old ticket old across
//! counter wraparound, and no interleaving of reservations may ever push
//! a buffer past its shared fence bound.

use proptest::prelude::*;

use std::sync::Arc;

use holdfast::core::buffer::{reserve_lock, ticket_older};
use holdfast::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    #[test]
    fn ticket_order_holds_across_wraparound(base in any::<u32>(), distance in 1u32..0x8000_0000) {
        let newer = base.wrapping_add(distance);

        // The earlier draw is older no matter where the counter wrapped.
        prop_assert!(ticket_older(base, newer));
        prop_assert!(!ticket_older(newer, base));
    }

    #[test]
    fn ticket_order_is_irreflexive(ticket in any::<u32>()) {
        prop_assert!(!ticket_older(ticket, ticket));
    }

    #[test]
    fn seqno_passes_exactly_the_signed_half_range(target in any::<u32>(), distance in 0u32..0x8000_0000) {
        let cells = SeqnoCells::new(1);

        // At or past the target: complete.
        cells.write(0, target.wrapping_add(distance));
        let fence = Fence::new_seqno(&cells, 0, target, 0);
        prop_assert!(fence.is_signaled());

        // Short of the target: pending.
        let behind = distance.max(1);
        cells.write(0, target.wrapping_sub(behind));
        let fence = Fence::new_seqno(&cells, 0, target, 0);
        prop_assert!(!fence.is_signaled());
    }
}

proptest! {
    // Each case runs a few hundred reservations; keep the count modest.
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn shared_fence_count_never_exceeds_bound(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
        let bo = Arc::new(BufferObject::new());
        let mut expected_shared = 0usize;

        for (seq, shared) in ops.into_iter().enumerate() {
            let intent = if shared { Intent::Shared } else { Intent::Exclusive };
            let entries = [ValidateEntry::new(Arc::clone(&bo), intent)];

            match batch::reserve(&entries, None) {
                Ok(()) => {
                    let fence = Fence::new_software(seq as u64);
                    batch::commit(&entries, &fence);
                    fence.signal().unwrap();
                    expected_shared = if shared { expected_shared + 1 } else { 0 };
                }
                Err(ReserveError::SharedCapacity) => {
                    // Only a shared request against a full set may fail,
                    // and it must leave nothing reserved.
                    prop_assert!(shared);
                    prop_assert_eq!(expected_shared, MAX_SHARED_FENCE);
                    prop_assert!(!bo.is_reserved());
                }
                Err(other) => return Err(TestCaseError::fail(format!("unexpected error {other:?}"))),
            }

            let guard = reserve_lock();
            let slots = bo.slots(&guard);
            prop_assert!(slots.shared.len() <= MAX_SHARED_FENCE);
            prop_assert_eq!(slots.shared.len(), expected_shared);
        }
    }
}
