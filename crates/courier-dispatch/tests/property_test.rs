//! Property-based tests for resolution decisions.
//!
//! Random statuses and budgets verify the retry-budget boundary holds for
//! every input.

use courier_dispatch::{dispatcher::decide, Resolution};
use proptest::prelude::*;

proptest! {
    /// Success acknowledges regardless of the recorded retry count.
    #[test]
    fn success_always_acknowledges(retries in 0i32..1000, max_retries in 0i32..1000) {
        prop_assert_eq!(decide(true, retries, max_retries), Resolution::Acknowledged);
    }

    /// A failure either retries or dead-letters, split exactly at the
    /// budget boundary.
    #[test]
    fn failure_splits_on_the_budget_boundary(retries in 0i32..1000, max_retries in 0i32..1000) {
        let expected = if retries >= max_retries {
            Resolution::DeadLettered
        } else {
            Resolution::Retried
        };
        prop_assert_eq!(decide(false, retries, max_retries), expected);
    }

    /// A permanently failing delivery makes exactly `max_retries + 1`
    /// attempts before dead-lettering.
    #[test]
    fn always_failing_delivery_attempts_budget_plus_one(max_retries in 0i32..100) {
        let mut retries = 0;
        let mut attempts = 0;

        loop {
            attempts += 1;
            match decide(false, retries, max_retries) {
                Resolution::Retried => retries += 1,
                Resolution::DeadLettered => break,
                Resolution::Acknowledged => prop_assert!(false, "failure cannot acknowledge"),
            }
        }

        prop_assert_eq!(attempts, max_retries + 1);
        prop_assert_eq!(retries, max_retries, "the dead letter records the full budget");
    }
}
