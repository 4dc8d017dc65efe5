#[cfg(test)]
mod tests {
    use crate::config::EngineConfig;
    use crate::error::ConfigError;
    use crate::types::{IssuanceMode, LockTimings, PerRequester, ResourcePolicy};

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.lock, LockTimings::new(3_000, 5_000));
        assert_eq!(config.intent_topic, "issuance-intents");
        assert_eq!(config.dead_letter_topic(), "issuance-intents.DLT");
        assert_eq!(config.max_finalize_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{ "lock": { "wait_ms": 5000, "lease_ms": 10000 }, "reconcile_tolerance": 2 }"#,
        )
        .unwrap();
        assert_eq!(config.lock.lease(), std::time::Duration::from_secs(10));
        assert_eq!(config.reconcile_tolerance, 2);
        assert_eq!(config.ticket_ttl_secs, 3_600);
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        let zero_lease = EngineConfig {
            lock: LockTimings::new(3_000, 0),
            ..EngineConfig::default()
        };
        assert!(matches!(zero_lease.validate(), Err(ConfigError::Invalid(_))));

        let zero_wait = EngineConfig {
            lock: LockTimings::new(0, 5_000),
            ..EngineConfig::default()
        };
        assert!(zero_wait.validate().is_err());

        let no_topic = EngineConfig {
            intent_topic: String::new(),
            ..EngineConfig::default()
        };
        assert!(no_topic.validate().is_err());
    }

    #[test]
    fn test_policy_document() {
        let policy: ResourcePolicy = serde_json::from_str(
            r#"{
                "resource_id": "spring-coupon",
                "total_quantity": 100,
                "valid_from": "2026-04-01T00:00:00Z",
                "valid_until": "2026-04-30T23:59:59Z",
                "per_requester": { "kind": "once", "reissue_after_cancel": true },
                "mode": "deferred",
                "lock": { "wait_ms": 5000, "lease_ms": 10000 },
                "payload": { "discount_percent": 15 }
            }"#,
        )
        .unwrap();

        assert!(policy.validate().is_ok());
        assert_eq!(
            policy.per_requester,
            PerRequester::Once {
                reissue_after_cancel: true
            }
        );
        assert_eq!(policy.mode, IssuanceMode::Deferred);
        assert!(!policy.requires_confirmation);
        assert_eq!(
            policy.lock_timings(LockTimings::default()),
            LockTimings::new(5_000, 10_000)
        );
        assert_eq!(policy.payload["discount_percent"], 15);
    }

    #[test]
    fn test_policy_defaults_and_validation() {
        let policy: ResourcePolicy = serde_json::from_str(
            r#"{
                "resource_id": "flash-sale",
                "total_quantity": 5,
                "valid_from": "2026-04-01T00:00:00Z",
                "valid_until": "2026-04-01T01:00:00Z"
            }"#,
        )
        .unwrap();
        assert_eq!(policy.per_requester, PerRequester::Unlimited);
        assert_eq!(policy.mode, IssuanceMode::Synchronous);
        assert_eq!(policy.lock_timings(LockTimings::default()), LockTimings::default());

        let mut negative = policy.clone();
        negative.total_quantity = -1;
        assert!(negative.validate().is_err());

        let mut inverted = policy;
        std::mem::swap(&mut inverted.valid_from, &mut inverted.valid_until);
        assert!(inverted.validate().is_err());
    }
}
