//! Property-based tests for adrewards-confirmations
//!
//! These tests use proptest to verify invariants across a wide range of inputs.

#[cfg(test)]
mod backoff_properties {
    use adrewards_confirmations::backoff_delay;
    use proptest::prelude::*;
    use std::time::Duration;

    proptest! {
        /// The delay never exceeds the ceiling
        #[test]
        fn backoff_is_capped(base in 1u64..3_600, attempts in 0u32..100, max in 1u64..86_400) {
            let delay = backoff_delay(Duration::from_secs(base), attempts, Duration::from_secs(max));
            prop_assert!(delay <= Duration::from_secs(max));
        }

        /// Each consecutive failure waits at least as long as the previous one
        #[test]
        fn backoff_is_monotonic(base in 1u64..3_600, attempts in 0u32..64, max in 1u64..86_400) {
            let base = Duration::from_secs(base);
            let max = Duration::from_secs(max);
            prop_assert!(backoff_delay(base, attempts + 1, max) >= backoff_delay(base, attempts, max));
        }

        /// The first attempt uses the base delay when it fits under the ceiling
        #[test]
        fn backoff_starts_at_base(base in 1u64..3_600, extra in 0u64..3_600) {
            let base = Duration::from_secs(base);
            let max = base + Duration::from_secs(extra);
            prop_assert_eq!(backoff_delay(base, 0, max), base);
        }
    }
}

#[cfg(test)]
mod token_store_properties {
    use adrewards_confirmations::testing::MockConfirmationsServer;
    use adrewards_confirmations::{ConfirmationsStateStore, UnblindedTokenStore, WalletInfo};
    use proptest::prelude::*;

    #[derive(Clone, Debug)]
    enum Step {
        Reserve,
        Release,
        Consume,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![Just(Step::Reserve), Just(Step::Release), Just(Step::Consume)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Every token is always in exactly one place: the pool, in flight or spent
        #[test]
        fn tokens_are_conserved(initial in 0usize..12, steps in prop::collection::vec(step(), 0..40)) {
            let server = MockConfirmationsServer::new();
            let wallet = WalletInfo::generate("payment");
            let store = ConfirmationsStateStore::in_memory();

            tokio_test::block_on(async {
                store.put(server.issue_unblinded_tokens(initial, &wallet)).await.unwrap();

                let mut in_flight = Vec::new();
                let mut spent = Vec::new();
                for step in steps {
                    match step {
                        Step::Reserve => {
                            if let Some(token) = store.reserve().await.unwrap() {
                                in_flight.push(token);
                            }
                        }
                        Step::Release => {
                            if let Some(token) = in_flight.pop() {
                                store.release(&token).await.unwrap();
                            }
                        }
                        Step::Consume => {
                            if let Some(token) = in_flight.pop() {
                                store.consume(&token).await.unwrap();
                                spent.push(token);
                            }
                        }
                    }
                }

                let pool = UnblindedTokenStore::get_all(&store).await.unwrap();
                assert_eq!(pool.len() + in_flight.len() + spent.len(), initial);
                assert_eq!(store.in_flight_count().await.unwrap(), in_flight.len());
                for token in &spent {
                    assert!(!pool.contains(token));
                    assert!(!in_flight.contains(token));
                }
            });
        }

        /// A released token is the next one offered
        #[test]
        fn release_returns_token_to_front(initial in 1usize..12, reserved in 1usize..12) {
            let server = MockConfirmationsServer::new();
            let wallet = WalletInfo::generate("payment");
            let store = ConfirmationsStateStore::in_memory();

            tokio_test::block_on(async {
                store.put(server.issue_unblinded_tokens(initial, &wallet)).await.unwrap();

                let mut taken = Vec::new();
                for _ in 0..reserved.min(initial) {
                    taken.push(store.reserve().await.unwrap().unwrap());
                }
                let last = taken.pop().unwrap();
                store.release(&last).await.unwrap();

                assert_eq!(store.get().await.unwrap(), Some(last));
            });
        }
    }
}

#[cfg(test)]
mod queue_properties {
    use adrewards_confirmations::{
        AdType, ConfirmationQueue, ConfirmationType, ConfirmationsStateStore, QueueItem,
        RewardConfirmation,
    };
    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// The queue hands items out oldest first regardless of insertion order
        #[test]
        fn queue_is_ordered_by_creation(offsets in prop::collection::vec(0i64..10_000, 1..20)) {
            let store = ConfirmationsStateStore::in_memory();
            let now = Utc::now();

            tokio_test::block_on(async {
                for offset in &offsets {
                    let mut item = QueueItem::new(RewardConfirmation::new(
                        "creative",
                        "placement",
                        ConfirmationType::View,
                        AdType::AdNotification,
                    ));
                    item.created_at = now + Duration::seconds(*offset);
                    store.push(item).await.unwrap();
                }

                let order: Vec<_> = store
                    .all()
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|item| item.created_at)
                    .collect();
                let mut sorted = order.clone();
                sorted.sort();
                assert_eq!(order, sorted);
            });
        }
    }
}
