use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::counter_store::CounterStore;
use crate::error::Error;
use crate::quota::LimitDimension;

/// Token dimensions charged when actual usage is known.
const RECONCILED_DIMENSIONS: [LimitDimension; 3] = [
    LimitDimension::GlobalTokensPerMinute,
    LimitDimension::GlobalTokensPerDay,
    LimitDimension::IdentityTokensPerDay,
];

/// Replaces the admission-time token estimate with actual consumption.
///
/// Runs exactly once per completed downstream call. If the call failed before
/// returning usage, nothing is recorded: the request slots the ledger
/// reserved stand, but token cost is charged from real usage only.
pub struct UsageReconciler {
    store: Arc<dyn CounterStore>,
}

impl UsageReconciler {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, identity: &str, actual_tokens: u64) -> Result<(), Error> {
        self.record_at(identity, actual_tokens, Utc::now()).await
    }

    pub(crate) async fn record_at(
        &self,
        identity: &str,
        actual_tokens: u64,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        for dimension in RECONCILED_DIMENSIONS {
            let key = dimension.counter_key(identity, now);
            let window = dimension.window();
            self.store.increment_by(&key, actual_tokens, window).await?;
            // Re-apply the expiry unconditionally: the key may have been
            // created moments ago under a different call's creation TTL, and
            // this call must still leave it expiring at its window length.
            self.store.expire(&key, window).await?;
        }
        tracing::debug!(
            identity = identity,
            tokens = actual_tokens,
            "Recorded actual token usage"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter_store::{FailingCounterStore, InMemoryCounterStore};
    use crate::error::ErrorDetails;
    use crate::quota::{LimitsConfig, QuotaLedger};
    use chrono::TimeZone;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap()
    }

    #[tokio::test]
    async fn test_record_charges_all_token_dimensions() {
        let store = Arc::new(InMemoryCounterStore::new());
        let ledger = QuotaLedger::new(store.clone(), LimitsConfig::default());
        let reconciler = UsageReconciler::new(store);
        let now = test_time();

        // Admit with a 100-token estimate, then record 87 actual tokens
        assert!(ledger.admit_at("u1", 100, now).await.unwrap().is_allowed());
        reconciler.record_at("u1", 87, now).await.unwrap();

        let status = ledger.status_at("u1", now).await.unwrap();
        assert_eq!(status.usage.identity_tpd, 87);
        assert_eq!(status.usage.tpd, 87);
        assert_eq!(status.usage.tpm, 87);
        // Request counters are the ledger's business, not the reconciler's
        assert_eq!(status.usage.rpm, 1);
    }

    #[tokio::test]
    async fn test_records_accumulate() {
        let store = Arc::new(InMemoryCounterStore::new());
        let ledger = QuotaLedger::new(store.clone(), LimitsConfig::default());
        let reconciler = UsageReconciler::new(store);
        let now = test_time();

        reconciler.record_at("u1", 87, now).await.unwrap();
        reconciler.record_at("u1", 13, now).await.unwrap();

        let status = ledger.status_at("u1", now).await.unwrap();
        assert_eq!(status.usage.identity_tpd, 100);
        assert_eq!(status.usage.tpm, 100);
    }

    #[tokio::test]
    async fn test_record_is_scoped_to_the_identity() {
        let store = Arc::new(InMemoryCounterStore::new());
        let ledger = QuotaLedger::new(store.clone(), LimitsConfig::default());
        let reconciler = UsageReconciler::new(store);
        let now = test_time();

        reconciler.record_at("u1", 50, now).await.unwrap();

        let other = ledger.status_at("u2", now).await.unwrap();
        assert_eq!(other.usage.identity_tpd, 0);
        // Global token counters are shared
        assert_eq!(other.usage.tpd, 50);
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let reconciler = UsageReconciler::new(Arc::new(FailingCounterStore));

        let err = reconciler.record_at("u1", 87, test_time()).await.unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::StoreUnavailable { .. }
        ));
    }
}
