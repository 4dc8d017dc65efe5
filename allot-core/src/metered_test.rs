#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::engine::IssuanceEngine;
    use crate::error::IssuanceError;
    use crate::metered::MeteredEngine;
    use crate::support_test::policy;
    use crate::types::{IssuanceStatus, ReserveRequest};

    #[tokio::test]
    async fn test_metered_engine_passes_results_through() {
        let engine = MeteredEngine::new(Arc::new(IssuanceEngine::in_memory()));
        let now = chrono::Utc::now();
        let mut p = policy("sale", 1);
        p.valid_from = now - chrono::Duration::minutes(5);
        p.valid_until = now + chrono::Duration::minutes(5);
        engine.activate(p).await.unwrap();

        let record = engine
            .reserve(&ReserveRequest::new("sale", "alice"))
            .await
            .unwrap();
        assert_eq!(record.status, IssuanceStatus::Confirmed);

        let err = engine
            .reserve(&ReserveRequest::new("sale", "bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, IssuanceError::Exhausted { .. }));
        assert_eq!(err.kind(), "exhausted");

        engine.cancel(&record.record_id, "alice").await.unwrap();
        assert_eq!(engine.inner().remaining("sale").await.unwrap(), Some(1));
    }
}
