#[cfg(test)]
mod tests {
    use crate::error::IssuanceError;
    use crate::state::IssuanceStateMachine;
    use crate::types::{IssuanceRecord, IssuanceStatus};
    use chrono::{TimeZone, Utc};

    fn record(status: IssuanceStatus, quantity: i64) -> IssuanceRecord {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        IssuanceRecord::new(
            "r1".to_string(),
            "coupon-1".to_string(),
            "alice".to_string(),
            quantity,
            status,
            now,
        )
    }

    #[test]
    fn test_forward_path() {
        let now = Utc::now();
        let mut rec = record(IssuanceStatus::Reserved, 1);

        let t = IssuanceStateMachine::apply(&mut rec, IssuanceStatus::Confirmed, now, None).unwrap();
        assert_eq!(t.returned_quantity, 0);
        assert_eq!(rec.confirmed_at, Some(now));

        let t = IssuanceStateMachine::apply(
            &mut rec,
            IssuanceStatus::Used,
            now,
            Some("order-9".to_string()),
        )
        .unwrap();
        assert_eq!(t.returned_quantity, 0);
        assert_eq!(rec.order_ref.as_deref(), Some("order-9"));
        assert_eq!(rec.status, IssuanceStatus::Used);
    }

    #[test]
    fn test_cancel_returns_quota_from_every_holding_status() {
        for status in IssuanceStatus::HOLDING {
            let mut rec = record(status, 3);
            let t = IssuanceStateMachine::apply(&mut rec, IssuanceStatus::Canceled, Utc::now(), None)
                .unwrap();
            assert_eq!(t.from, status);
            assert_eq!(t.returned_quantity, 3, "cancel from {status} must return quota");
        }
    }

    #[test]
    fn test_cancel_after_use_clears_order() {
        let mut rec = record(IssuanceStatus::Used, 1);
        rec.order_ref = Some("order-1".to_string());
        IssuanceStateMachine::apply(&mut rec, IssuanceStatus::Canceled, Utc::now(), None).unwrap();
        assert!(rec.order_ref.is_none());
        assert!(rec.canceled_at.is_some());
    }

    #[test]
    fn test_failed_only_from_reserved() {
        let mut rec = record(IssuanceStatus::Reserved, 2);
        let t = IssuanceStateMachine::apply(&mut rec, IssuanceStatus::Failed, Utc::now(), None).unwrap();
        assert_eq!(t.returned_quantity, 2);

        let mut rec = record(IssuanceStatus::Confirmed, 1);
        let err = IssuanceStateMachine::apply(&mut rec, IssuanceStatus::Failed, Utc::now(), None)
            .unwrap_err();
        assert!(matches!(err, IssuanceError::InvalidTransition { .. }));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [IssuanceStatus::Canceled, IssuanceStatus::Failed] {
            for to in IssuanceStatus::ALL {
                assert!(!IssuanceStateMachine::allows(terminal, to));
            }
        }
    }

    #[test]
    fn test_rejected_transition_leaves_record_untouched() {
        let mut rec = record(IssuanceStatus::Reserved, 1);
        let before = rec.clone();
        assert!(IssuanceStateMachine::apply(&mut rec, IssuanceStatus::Used, Utc::now(), None).is_err());
        assert_eq!(rec, before);
    }
}
