//! Delivery status transition rules
//!
//! Statuses only move forward (`sent` < `delivered` < `read`). `failed` can be
//! reached from any of them and is terminal. Counter deltas telescope: after
//! any callback sequence the summed deltas equal what the final status alone
//! implies, so duplicates and reordering never double count.

use crate::db::models::DeliveryStatus;
use crate::db::repositories::CounterDelta;

/// Accepted change of a delivery record
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: DeliveryStatus,
    pub delta: CounterDelta,
    /// The message just reached the recipient; the pending note may go out
    pub post_note: bool,
}

/// Decide what a callback reporting `incoming` does to a record at `current`.
///
/// `None` means the callback is a duplicate or arrived out of order.
pub fn transition(current: DeliveryStatus, incoming: DeliveryStatus, cost: f64) -> Option<Transition> {
    if current == incoming || current == DeliveryStatus::Failed {
        return None;
    }

    if incoming == DeliveryStatus::Failed {
        let delta = CounterDelta {
            failed: 1,
            delivered: -i64::from(current.reached_recipient()),
            read: -i64::from(current == DeliveryStatus::Read),
            cost: -cost,
            ..Default::default()
        };
        return Some(Transition {
            next: incoming,
            delta,
            post_note: false,
        });
    }

    if incoming.rank() < current.rank() {
        return None;
    }

    let delta = CounterDelta {
        delivered: i64::from(incoming.reached_recipient() && !current.reached_recipient()),
        read: i64::from(incoming == DeliveryStatus::Read),
        ..Default::default()
    };
    Some(Transition {
        next: incoming,
        delta,
        post_note: incoming.reached_recipient(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_duplicate_is_ignored() {
        assert!(transition(DeliveryStatus::Delivered, DeliveryStatus::Delivered, 0.1).is_none());
    }

    #[test]
    fn test_backward_is_ignored() {
        assert!(transition(DeliveryStatus::Read, DeliveryStatus::Delivered, 0.1).is_none());
        assert!(transition(DeliveryStatus::Delivered, DeliveryStatus::Sent, 0.1).is_none());
    }

    #[test]
    fn test_failed_is_terminal() {
        assert!(transition(DeliveryStatus::Failed, DeliveryStatus::Read, 0.1).is_none());
    }

    #[test]
    fn test_read_skipping_delivered_counts_both() {
        let t = transition(DeliveryStatus::Sent, DeliveryStatus::Read, 0.0).unwrap();
        assert_eq!(t.delta.delivered, 1);
        assert_eq!(t.delta.read, 1);
        assert!(t.post_note);
    }

    #[test]
    fn test_failure_after_delivery_refunds() {
        let t = transition(DeliveryStatus::Delivered, DeliveryStatus::Failed, 0.25).unwrap();
        assert_eq!(t.delta.failed, 1);
        assert_eq!(t.delta.delivered, -1);
        assert_eq!(t.delta.read, 0);
        assert!((t.delta.cost + 0.25).abs() < f64::EPSILON);
        assert!(!t.post_note);
    }

    fn any_status() -> impl Strategy<Value = DeliveryStatus> {
        prop_oneof![
            Just(DeliveryStatus::Sent),
            Just(DeliveryStatus::Delivered),
            Just(DeliveryStatus::Read),
            Just(DeliveryStatus::Failed),
        ]
    }

    proptest! {
        #[test]
        fn prop_counters_match_final_status(callbacks in prop::collection::vec(any_status(), 0..12)) {
            let cost = 0.5;
            let mut status = DeliveryStatus::Sent;
            let mut total = CounterDelta::default();
            for incoming in callbacks {
                if let Some(t) = transition(status, incoming, cost) {
                    prop_assert!(t.next != status);
                    status = t.next;
                    total = total + t.delta;
                }
            }

            prop_assert_eq!(total.delivered, i64::from(status.reached_recipient()));
            prop_assert_eq!(total.read, i64::from(status == DeliveryStatus::Read));
            prop_assert_eq!(total.failed, i64::from(status == DeliveryStatus::Failed));
            let refund = if status == DeliveryStatus::Failed { -cost } else { 0.0 };
            prop_assert!((total.cost - refund).abs() < 1e-9);
        }
    }
}
