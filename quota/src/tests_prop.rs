#![cfg(test)]
//! Property-based tests for the quota tracker
//!
//! Random interleavings of reservations and releases must never break the
//! tier ceilings, and counters must always equal the charges held.

use crate::{Charge, MessageCount, QuotaKind, QuotaLimits, QuotaTracker};
use bus_types::UserId;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Send(u32),
    Notify,
    Release(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u32..4).prop_map(Op::Send),
        1 => Just(Op::Notify),
        2 => any::<usize>().prop_map(Op::Release),
    ]
}

proptest! {
    #[test]
    fn tiers_hold_under_any_interleaving(ops in proptest::collection::vec(arb_op(), 0..400)) {
        let limits = QuotaLimits::default()
            .with_max_msgs(MessageCount::new(48))
            .with_max_msgs_unaccounted(MessageCount::new(8))
            .with_max_msgs_per_user(MessageCount::new(8));
        let mut tracker = QuotaTracker::new(limits);
        let mut held: Vec<Charge> = Vec::new();

        for op in ops {
            match op {
                Op::Send(raw) => {
                    if let Ok(charge) = tracker.reserve(QuotaKind::Message(UserId::new(raw))) {
                        held.push(charge);
                    }
                }
                Op::Notify => {
                    if let Ok(charge) = tracker.reserve(QuotaKind::Notification) {
                        held.push(charge);
                    }
                }
                Op::Release(index) => {
                    if !held.is_empty() {
                        let charge = held.remove(index % held.len());
                        tracker.release(charge);
                    }
                }
            }

            let usage = tracker.usage();
            prop_assert_eq!(usage.queued.0 as usize, held.len());
            prop_assert!(usage.user_messages <= limits.max_msgs);
            for raw in 0..4 {
                let user = UserId::new(raw);
                let accounted = held.iter().filter(|c| **c == Charge::Accounted(user)).count();
                prop_assert_eq!(tracker.accounted_for(user).0 as usize, accounted);
                prop_assert!(tracker.accounted_for(user) <= limits.max_msgs_per_user);
            }
        }
    }
}
