#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    use crate::config::EngineConfig;
    use crate::error::{IssuanceError, Signal};
    use crate::keys;
    use crate::reconcile::{ReconcileAction, Reconciler};
    use crate::support_test::{Harness, policy, t0};
    use crate::types::{
        IssuanceMode, IssuanceStatus, Issued, LockTimings, PerRequester, ReserveRequest,
    };

    fn once(reissue_after_cancel: bool) -> PerRequester {
        PerRequester::Once {
            reissue_after_cancel,
        }
    }

    #[tokio::test]
    async fn test_two_concurrent_requesters_for_last_unit() {
        let h = Harness::new();
        h.engine
            .activate(policy("coupon", 1).with_per_requester(once(false)))
            .await
            .unwrap();

        let a = ReserveRequest::new("coupon", "alice");
        let b = ReserveRequest::new("coupon", "bob");
        let (ra, rb) = tokio::join!(h.engine.reserve(&a), h.engine.reserve(&b));

        let results = [ra, rb];
        let granted: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].status, IssuanceStatus::Confirmed);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(IssuanceError::Exhausted { .. })))
        );

        assert_eq!(h.engine.remaining("coupon").await.unwrap(), Some(0));

        let reconciler = Reconciler::new(h.engine.clone());
        let report = reconciler.reconcile("coupon").await.unwrap();
        assert_eq!(report.action, ReconcileAction::InSync);
        assert_eq!(report.held, 1);
    }

    #[tokio::test]
    async fn test_sixth_reserve_exhausted_and_counter_stays_at_zero() {
        let h = Harness::new();
        h.engine.activate(policy("sale", 5)).await.unwrap();

        for i in 0..5 {
            let req = ReserveRequest::new("sale", format!("buyer-{i}"));
            h.engine.reserve(&req).await.unwrap();
        }

        let err = h
            .engine
            .reserve(&ReserveRequest::new("sale", "late"))
            .await
            .unwrap_err();
        assert!(matches!(err, IssuanceError::Exhausted { .. }));
        assert_eq!(err.signal(), Signal::NotAvailable);
        assert!(!err.is_retryable());
        assert_eq!(h.engine.remaining("sale").await.unwrap(), Some(0));
        assert_eq!(h.records("sale").len(), 5);
    }

    #[tokio::test]
    async fn test_underflow_compensation_restores_exact_value() {
        let h = Harness::new();
        h.engine.activate(policy("sale", 2)).await.unwrap();

        let big = ReserveRequest::new("sale", "bulk").with_quantity(3);
        let err = h.engine.reserve(&big).await.unwrap_err();

        assert!(matches!(err, IssuanceError::Exhausted { .. }));
        assert_eq!(h.engine.remaining("sale").await.unwrap(), Some(2));
        assert!(h.records("sale").is_empty());

        // the restored quantity is still usable
        let fits = ReserveRequest::new("sale", "bulk").with_quantity(2);
        h.engine.reserve(&fits).await.unwrap();
        assert_eq!(h.engine.remaining("sale").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_cancellation_returns_quota() {
        let h = Harness::new();
        h.engine.activate(policy("sale", 10)).await.unwrap();

        let mut records = Vec::new();
        for i in 0..4 {
            let req = ReserveRequest::new("sale", format!("buyer-{i}"));
            records.push(h.engine.reserve(&req).await.unwrap());
        }
        for record in &records[..3] {
            let canceled = h
                .engine
                .cancel(&record.record_id, &record.requester_id)
                .await
                .unwrap();
            assert_eq!(canceled.status, IssuanceStatus::Canceled);
        }

        // total - (reserved - canceled)
        assert_eq!(h.engine.remaining("sale").await.unwrap(), Some(10 - (4 - 3)));
        assert_eq!(h.holding("sale"), 1);
    }

    #[tokio::test]
    async fn test_cancel_after_use_returns_quantity_and_clears_order() {
        let h = Harness::new();
        h.engine.activate(policy("sale", 5)).await.unwrap();

        let req = ReserveRequest::new("sale", "alice").with_quantity(2);
        let record = h.engine.reserve(&req).await.unwrap();
        let used = h
            .engine
            .use_record(&record.record_id, "alice", "order-1")
            .await
            .unwrap();
        assert_eq!(used.status, IssuanceStatus::Used);
        assert_eq!(used.order_ref.as_deref(), Some("order-1"));
        assert_eq!(h.engine.remaining("sale").await.unwrap(), Some(3));

        let canceled = h.engine.cancel(&record.record_id, "alice").await.unwrap();
        assert_eq!(canceled.order_ref, None);
        assert!(canceled.canceled_at.is_some());
        assert_eq!(h.engine.remaining("sale").await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_canceled_grant_blocks_reissue_by_default() {
        let h = Harness::new();
        h.engine
            .activate(policy("coupon", 3).with_per_requester(once(false)))
            .await
            .unwrap();

        let req = ReserveRequest::new("coupon", "alice");
        let record = h.engine.reserve(&req).await.unwrap();
        h.engine.cancel(&record.record_id, "alice").await.unwrap();
        assert_eq!(h.engine.remaining("coupon").await.unwrap(), Some(3));

        let err = h.engine.reserve(&req).await.unwrap_err();
        assert!(matches!(err, IssuanceError::AlreadyIssued { .. }));
        assert_eq!(err.signal(), Signal::AlreadyHave);
        assert_eq!(h.engine.remaining("coupon").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_canceled_grant_allows_reissue_when_configured() {
        let h = Harness::new();
        h.engine
            .activate(policy("coupon", 3).with_per_requester(once(true)))
            .await
            .unwrap();

        let req = ReserveRequest::new("coupon", "alice");
        let first = h.engine.reserve(&req).await.unwrap();

        let err = h.engine.reserve(&req).await.unwrap_err();
        assert!(matches!(err, IssuanceError::AlreadyIssued { .. }));

        h.engine.cancel(&first.record_id, "alice").await.unwrap();
        let second = h.engine.reserve(&req).await.unwrap();
        assert_ne!(first.record_id, second.record_id);
        assert_eq!(h.engine.remaining("coupon").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_failed_record_does_not_block_and_returns_quota() {
        let h = Harness::new();
        h.engine
            .activate(
                policy("coupon", 2)
                    .with_per_requester(once(false))
                    .with_confirmation(true),
            )
            .await
            .unwrap();

        let req = ReserveRequest::new("coupon", "alice");
        let record = h.engine.reserve(&req).await.unwrap();
        assert_eq!(record.status, IssuanceStatus::Reserved);

        let failed = h.engine.fail(&record.record_id).await.unwrap();
        assert_eq!(failed.status, IssuanceStatus::Failed);
        assert_eq!(h.engine.remaining("coupon").await.unwrap(), Some(2));

        h.engine.reserve(&req).await.unwrap();
    }

    #[tokio::test]
    async fn test_reserve_after_window_is_always_out_of_window() {
        let h = Harness::new();
        h.engine.activate(policy("sale", 5)).await.unwrap();
        h.clock.advance(ChronoDuration::hours(2));

        for requester in ["alice", "bob", "carol"] {
            let err = h
                .engine
                .reserve(&ReserveRequest::new("sale", requester))
                .await
                .unwrap_err();
            assert!(matches!(err, IssuanceError::OutOfWindow { .. }));
        }
        assert_eq!(h.engine.remaining("sale").await.unwrap(), Some(5));
        assert!(h.records("sale").is_empty());
    }

    #[tokio::test]
    async fn test_reserve_before_window_opens() {
        let h = Harness::new();
        h.engine.activate(policy("sale", 5)).await.unwrap();
        h.clock.set(t0() - ChronoDuration::hours(3));

        let err = h
            .engine
            .reserve(&ReserveRequest::new("sale", "early"))
            .await
            .unwrap_err();
        assert!(matches!(err, IssuanceError::OutOfWindow { .. }));
    }

    #[tokio::test]
    async fn test_confirmation_flow() {
        let h = Harness::new();
        h.engine
            .activate(policy("coupon", 1).with_confirmation(true))
            .await
            .unwrap();

        let record = h
            .engine
            .reserve(&ReserveRequest::new("coupon", "alice"))
            .await
            .unwrap();
        assert_eq!(record.status, IssuanceStatus::Reserved);
        assert_eq!(record.confirmed_at, None);

        let confirmed = h.engine.confirm(&record.record_id, "alice").await.unwrap();
        assert_eq!(confirmed.status, IssuanceStatus::Confirmed);
        assert!(confirmed.confirmed_at.is_some());
        assert_eq!(h.engine.remaining("coupon").await.unwrap(), Some(0));

        let err = h
            .engine
            .confirm(&record.record_id, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, IssuanceError::InvalidTransition { .. }));

        let cached = h.engine.record(&record.record_id).await.unwrap();
        assert_eq!(cached.status, IssuanceStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_transitions_require_the_owning_requester() {
        let h = Harness::new();
        h.engine.activate(policy("sale", 2)).await.unwrap();
        let record = h
            .engine
            .reserve(&ReserveRequest::new("sale", "alice"))
            .await
            .unwrap();

        let err = h.engine.cancel(&record.record_id, "mallory").await.unwrap_err();
        assert!(matches!(err, IssuanceError::RecordNotFound(_)));
        assert_eq!(h.engine.remaining("sale").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_use_requires_open_window() {
        let h = Harness::new();
        h.engine.activate(policy("coupon", 1)).await.unwrap();
        let record = h
            .engine
            .reserve(&ReserveRequest::new("coupon", "alice"))
            .await
            .unwrap();

        h.clock.advance(ChronoDuration::hours(2));
        let err = h
            .engine
            .use_record(&record.record_id, "alice", "order-9")
            .await
            .unwrap_err();
        assert!(matches!(err, IssuanceError::OutOfWindow { .. }));

        // cancel is still allowed after the window closes
        h.engine.cancel(&record.record_id, "alice").await.unwrap();
        assert_eq!(h.engine.remaining("coupon").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_request_validation() {
        let h = Harness::new();
        h.engine.activate(policy("sale", 2)).await.unwrap();

        let err = h
            .engine
            .reserve(&ReserveRequest::new("sale", "alice").with_quantity(0))
            .await
            .unwrap_err();
        assert!(matches!(err, IssuanceError::InvalidRequest(_)));

        let err = h
            .engine
            .reserve(&ReserveRequest::new("sale", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, IssuanceError::InvalidRequest(_)));

        let err = h
            .engine
            .reserve(&ReserveRequest::new("missing", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, IssuanceError::PolicyNotFound(_)));
    }

    #[tokio::test]
    async fn test_activate_rejects_invalid_policy() {
        let h = Harness::new();
        let mut bad = policy("sale", 2);
        bad.valid_until = bad.valid_from;

        let err = h.engine.activate(bad).await.unwrap_err();
        assert!(matches!(err, IssuanceError::InvalidRequest(_)));
        assert_eq!(h.engine.remaining("sale").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reactivation_accounts_for_held_quota() {
        let h = Harness::new();
        h.engine.activate(policy("sale", 5)).await.unwrap();
        for requester in ["a", "b"] {
            h.engine
                .reserve(&ReserveRequest::new("sale", requester))
                .await
                .unwrap();
        }

        h.engine.activate(policy("sale", 5)).await.unwrap();
        assert_eq!(h.engine.remaining("sale").await.unwrap(), Some(3));

        // raising the total frees the difference
        h.engine.activate(policy("sale", 8)).await.unwrap();
        assert_eq!(h.engine.remaining("sale").await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn test_missing_counter_is_seeded_from_durable_records() {
        let h = Harness::new();
        let p = policy("sale", 4);
        h.engine.ports().store.save_policy(&p).await.unwrap();
        assert_eq!(h.engine.remaining("sale").await.unwrap(), None);

        h.engine
            .reserve(&ReserveRequest::new("sale", "alice"))
            .await
            .unwrap();
        assert_eq!(h.engine.remaining("sale").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_issue_follows_policy_mode() {
        let h = Harness::new();
        h.engine.activate(policy("sync", 2)).await.unwrap();
        h.engine
            .activate(policy("burst", 2).with_mode(IssuanceMode::Deferred))
            .await
            .unwrap();

        let issued = h
            .engine
            .issue(&ReserveRequest::new("sync", "alice"))
            .await
            .unwrap();
        assert!(matches!(issued, Issued::Record(_)));

        let issued = h
            .engine
            .issue(&ReserveRequest::new("burst", "alice"))
            .await
            .unwrap();
        assert!(matches!(issued, Issued::Ticket(_)));
        assert!(h.records("burst").is_empty());
    }

    #[tokio::test]
    async fn test_unlock_never_called_without_ownership() {
        let h = Harness::new();
        h.engine.activate(policy("sale", 3)).await.unwrap();

        let mut outcomes = Vec::new();
        for i in 0..6 {
            outcomes.push(
                h.engine
                    .reserve(&ReserveRequest::new("sale", format!("buyer-{i}")))
                    .await,
            );
        }
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 3);

        // activate + six reserves, every one released by its owner
        assert_eq!(h.lock.unlocks(), 7);
        assert_eq!(h.lock.unlocks_while_not_held(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_not_released() {
        let h = Harness::new();
        h.engine
            .activate(policy("sale", 3).with_lock(LockTimings::new(1_000, 100)))
            .await
            .unwrap();
        let before = h.lock.unlocks();

        // the save outlives the lease
        h.store.delay_saves(Duration::from_millis(500));
        h.engine
            .reserve(&ReserveRequest::new("sale", "slow"))
            .await
            .unwrap();

        assert_eq!(h.lock.unlocks(), before);
        assert_eq!(h.lock.unlocks_while_not_held(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_when_lock_wait_runs_out() {
        let h = Harness::new();
        h.engine
            .activate(policy("sale", 3).with_lock(LockTimings::new(50, 5_000)))
            .await
            .unwrap();

        let held = h
            .engine
            .ports()
            .lock
            .try_lock(&keys::lock("sale"), Duration::ZERO, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let err = h
            .engine
            .reserve(&ReserveRequest::new("sale", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, IssuanceError::Busy { .. }));
        assert!(err.is_retryable());
        assert_eq!(err.signal(), Signal::TryAgain);
        assert_eq!(h.engine.remaining("sale").await.unwrap(), Some(3));

        h.engine.ports().lock.unlock(&held).await.unwrap();
        h.engine
            .reserve(&ReserveRequest::new("sale", "alice"))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_lock_wait() {
        let h = Harness::new();
        h.engine.activate(policy("sale", 3)).await.unwrap();

        let _held = h
            .engine
            .ports()
            .lock
            .try_lock(&keys::lock("sale"), Duration::ZERO, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let token = CancellationToken::new();
        let req = ReserveRequest::new("sale", "alice");
        let (result, _) = tokio::join!(h.engine.reserve_with_cancel(&req, &token), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        assert!(matches!(result, Err(IssuanceError::Interrupted { .. })));
        assert_eq!(h.engine.remaining("sale").await.unwrap(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_reserve_releases_lock_it_holds() {
        let h = Harness::new();
        h.engine
            .activate(policy("sale", 3).with_lock(LockTimings::new(30_000, 60_000)))
            .await
            .unwrap();

        h.store.delay_saves(Duration::from_secs(10));
        let timed_out = tokio::time::timeout(
            Duration::from_millis(100),
            h.engine.reserve(&ReserveRequest::new("sale", "a")),
        )
        .await;
        assert!(timed_out.is_err());
        h.store.delay_saves(Duration::ZERO);

        // released from Drop, long before the 60s lease would run out
        let started = tokio::time::Instant::now();
        let record = h
            .engine
            .reserve(&ReserveRequest::new("sale", "b"))
            .await
            .unwrap();
        assert_eq!(record.requester_id, "b");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(h.lock.unlocks_while_not_held(), 0);

        // the dropped call had decremented but never wrote its record
        assert_eq!(h.records("sale").len(), 1);
        assert_eq!(h.engine.remaining("sale").await.unwrap(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_inside_lock_leaves_counter_untouched() {
        let h = Harness::new();
        h.engine
            .activate(policy("coupon", 3).with_per_requester(once(false)))
            .await
            .unwrap();
        h.store.delay_lookups(Duration::from_millis(200));
        let before = h.lock.unlocks();

        let token = CancellationToken::new();
        let req = ReserveRequest::new("coupon", "alice");
        let (result, _) = tokio::join!(h.engine.reserve_with_cancel(&req, &token), async {
            // the reserve now holds the lock and waits on the eligibility check
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        assert!(matches!(result, Err(IssuanceError::Interrupted { .. })));
        assert_eq!(h.engine.remaining("coupon").await.unwrap(), Some(3));
        assert!(h.records("coupon").is_empty());
        assert_eq!(h.lock.unlocks(), before + 1);
        assert_eq!(h.lock.unlocks_while_not_held(), 0);

        h.store.delay_lookups(Duration::ZERO);
        h.engine.reserve(&req).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_token_never_touches_counter() {
        let h = Harness::new();
        h.engine.activate(policy("sale", 3)).await.unwrap();
        let before = h.lock.unlocks();

        let token = CancellationToken::new();
        token.cancel();
        let err = h
            .engine
            .reserve_with_cancel(&ReserveRequest::new("sale", "alice"), &token)
            .await
            .unwrap_err();

        assert!(matches!(err, IssuanceError::Interrupted { .. }));
        assert_eq!(h.engine.remaining("sale").await.unwrap(), Some(3));
        assert_eq!(h.lock.unlocks(), before);
    }

    #[tokio::test]
    async fn test_store_failure_after_decrement_is_repaired_by_reconciliation() {
        let h = Harness::new();
        h.engine.activate(policy("sale", 3)).await.unwrap();

        h.store.fail_saves(true);
        let err = h
            .engine
            .reserve(&ReserveRequest::new("sale", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, IssuanceError::Store(_)));
        assert_eq!(err.signal(), Signal::Failure);
        // decremented with no record behind it
        assert_eq!(h.engine.remaining("sale").await.unwrap(), Some(2));
        assert_eq!(h.lock.unlocks_while_not_held(), 0);

        h.store.fail_saves(false);
        let reconciler = Reconciler::new(h.engine.clone());
        let first = reconciler.reconcile("sale").await.unwrap();
        assert_eq!(first.drift, -1);
        assert_eq!(first.action, ReconcileAction::Pending { strikes: 1 });

        let second = reconciler.reconcile("sale").await.unwrap();
        assert_eq!(second.action, ReconcileAction::Reseeded);
        assert_eq!(h.engine.remaining("sale").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_engine_rejects_invalid_config() {
        let config = EngineConfig {
            max_finalize_attempts: 0,
            ..EngineConfig::default()
        };
        let result = crate::engine::IssuanceEngine::new(crate::infrastructure::Ports::in_memory(), config);
        assert!(result.is_err());
    }

    #[derive(Debug, Clone)]
    struct Step {
        requester: usize,
        quantity: i64,
        cancel: bool,
    }

    fn step() -> impl Strategy<Value = Step> {
        (0usize..6, 1i64..4, any::<bool>()).prop_map(|(requester, quantity, cancel)| Step {
            requester,
            quantity,
            cancel,
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: however concurrent reserves and cancels interleave, held
        /// quota never exceeds the total and the counter always equals
        /// `total - held`.
        #[test]
        fn quota_is_never_over_issued(
            total in 0i64..8,
            once_per_requester in any::<bool>(),
            steps in prop::collection::vec(step(), 1..24),
        ) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let h = Harness::new();
                let mut p = policy("quota", total);
                if once_per_requester {
                    p = p.with_per_requester(once(true));
                }
                h.engine.activate(p).await.unwrap();

                let mut tasks = Vec::new();
                for step in steps {
                    let engine = Arc::clone(&h.engine);
                    tasks.push(tokio::spawn(async move {
                        let req = ReserveRequest::new("quota", format!("r{}", step.requester))
                            .with_quantity(step.quantity);
                        match engine.reserve(&req).await {
                            Ok(record) if step.cancel => {
                                engine.cancel(&record.record_id, &record.requester_id).await.unwrap();
                            }
                            Ok(_) => {}
                            Err(IssuanceError::Exhausted { .. })
                            | Err(IssuanceError::AlreadyIssued { .. }) => {}
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }));
                }
                for task in tasks {
                    task.await.unwrap();
                }

                let held = h.holding("quota");
                let remaining = h.engine.remaining("quota").await.unwrap().unwrap();
                assert!(held <= total);
                assert!(remaining >= 0);
                assert_eq!(remaining, total - held);
                assert_eq!(h.lock.unlocks_while_not_held(), 0);
            });
        }
    }
}
