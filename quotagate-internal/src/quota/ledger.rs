use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::counter_store::CounterStore;
use crate::error::Error;
use crate::quota::bucket::{self, DAY_WINDOW};
use crate::quota::{
    LedgerMetrics, LimitDimension, LimitsConfig, QuotaDecision, QuotaFigures, QuotaStatus,
    CHECK_PRECEDENCE,
};

/// Request counters reserved at admission time. Token counters are deliberately
/// absent: estimates must not pollute the ledger before the true cost is known.
const RESERVED_ON_ADMIT: [LimitDimension; 3] = [
    LimitDimension::GlobalRequestsPerMinute,
    LimitDimension::GlobalRequestsPerDay,
    LimitDimension::IdentityRequestsPerDay,
];

/// The admission side of the quota engine.
///
/// Each admission reads the full counter snapshot, walks the dimensions in
/// `CHECK_PRECEDENCE`, and on success reserves request-count capacity by
/// incrementing only the request counters. Per-key atomicity in the store is
/// the only synchronization: the snapshot may be slightly stale by the time
/// the increments land, which skews reported remaining quota but can never
/// corrupt a counter or let a request past a hard ceiling unobserved.
pub struct QuotaLedger {
    store: Arc<dyn CounterStore>,
    limits: LimitsConfig,
    metrics: Arc<LedgerMetrics>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn CounterStore>, limits: LimitsConfig) -> Self {
        Self {
            store,
            limits,
            metrics: Arc::new(LedgerMetrics::default()),
        }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    pub fn metrics(&self) -> &LedgerMetrics {
        &self.metrics
    }

    /// Check every limit dimension for `identity` and, if all pass, reserve
    /// the request slots. A store failure propagates as an error so the
    /// caller fails closed; it is never reported as available quota.
    pub async fn admit(
        &self,
        identity: &str,
        estimated_tokens: u64,
    ) -> Result<QuotaDecision, Error> {
        self.admit_at(identity, estimated_tokens, Utc::now()).await
    }

    pub(crate) async fn admit_at(
        &self,
        identity: &str,
        estimated_tokens: u64,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, Error> {
        let (mut usage, limits) = self.snapshot_at(identity, now).await?;

        for dimension in CHECK_PRECEDENCE {
            let cost = if dimension.counts_tokens() {
                estimated_tokens
            } else {
                1
            };
            if usage.get(dimension) + cost > limits.get(dimension) {
                self.metrics.record_rejected();
                tracing::debug!(
                    identity = identity,
                    dimension = dimension.as_str(),
                    "Admission rejected"
                );
                return Ok(QuotaDecision::Deny {
                    dimension,
                    usage,
                    limits,
                });
            }
        }

        for dimension in RESERVED_ON_ADMIT {
            let key = dimension.counter_key(identity, now);
            let value = self
                .store
                .increment(&key, dimension.window())
                .await
                .inspect_err(|_| self.metrics.record_store_error())?;
            // The store's post-increment value is authoritative; it already
            // reflects any concurrently admitted requests.
            usage.set(dimension, value);
        }

        self.metrics.record_admitted();
        Ok(QuotaDecision::Allow { usage, limits })
    }

    /// Read-only snapshot for dashboards and diagnostics.
    pub async fn status(&self, identity: &str) -> Result<QuotaStatus, Error> {
        self.status_at(identity, Utc::now()).await
    }

    pub(crate) async fn status_at(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<QuotaStatus, Error> {
        let (usage, limits) = self.snapshot_at(identity, now).await?;
        Ok(QuotaStatus {
            usage,
            limits,
            remaining: limits.remaining(&usage),
        })
    }

    /// Credit `tokens` to `identity` for the current day, raising its
    /// effective tokens-per-day ceiling. Returns the day's granted total.
    /// Called by the purchase and ad-reward adapters after they have verified
    /// the grant upstream.
    pub async fn grant(&self, identity: &str, tokens: u64) -> Result<u64, Error> {
        self.grant_at(identity, tokens, Utc::now()).await
    }

    pub(crate) async fn grant_at(
        &self,
        identity: &str,
        tokens: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let key = bucket::grant_counter_key(identity, now);
        let granted_today = self
            .store
            .increment_by(&key, tokens, DAY_WINDOW)
            .await
            .inspect_err(|_| self.metrics.record_store_error())?;
        tracing::info!(identity = identity, tokens = tokens, "Token grant credited");
        Ok(granted_today)
    }

    /// Read all counters relevant to `identity` plus its grant counter. Any
    /// single read failure fails the whole snapshot.
    async fn snapshot_at(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<(QuotaFigures, QuotaFigures), Error> {
        let rpm_key = LimitDimension::GlobalRequestsPerMinute.counter_key(identity, now);
        let rpd_key = LimitDimension::GlobalRequestsPerDay.counter_key(identity, now);
        let tpm_key = LimitDimension::GlobalTokensPerMinute.counter_key(identity, now);
        let tpd_key = LimitDimension::GlobalTokensPerDay.counter_key(identity, now);
        let identity_rpd_key = LimitDimension::IdentityRequestsPerDay.counter_key(identity, now);
        let identity_tpd_key = LimitDimension::IdentityTokensPerDay.counter_key(identity, now);
        let grant_key = bucket::grant_counter_key(identity, now);

        let (rpm, rpd, tpm, tpd, identity_rpd, identity_tpd, granted_today) = tokio::try_join!(
            self.store.get(&rpm_key),
            self.store.get(&rpd_key),
            self.store.get(&tpm_key),
            self.store.get(&tpd_key),
            self.store.get(&identity_rpd_key),
            self.store.get(&identity_tpd_key),
            self.store.get(&grant_key),
        )
        .inspect_err(|_| self.metrics.record_store_error())?;

        let usage = QuotaFigures {
            rpm,
            rpd,
            tpm,
            tpd,
            identity_rpd,
            identity_tpd,
        };
        Ok((usage, self.limits.effective(granted_today)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter_store::{FailingCounterStore, InMemoryCounterStore};
    use crate::error::ErrorDetails;
    use chrono::TimeZone;
    use std::sync::atomic::Ordering;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap()
    }

    fn test_ledger() -> (Arc<InMemoryCounterStore>, QuotaLedger) {
        let store = Arc::new(InMemoryCounterStore::new());
        let ledger = QuotaLedger::new(store.clone(), LimitsConfig::default());
        (store, ledger)
    }

    #[tokio::test]
    async fn test_first_admit_reserves_request_slots_only() {
        let (_, ledger) = test_ledger();
        let now = test_time();

        let decision = ledger.admit_at("u1", 100, now).await.unwrap();
        let QuotaDecision::Allow { usage, limits } = decision else {
            panic!("first admission should be allowed");
        };

        assert_eq!(usage.rpm, 1);
        assert_eq!(usage.rpd, 1);
        assert_eq!(usage.identity_rpd, 1);
        // Token counters stay untouched until the reconciler runs
        assert_eq!(usage.tpm, 0);
        assert_eq!(usage.tpd, 0);
        assert_eq!(usage.identity_tpd, 0);

        assert_eq!(limits.rpm, 30);
        assert_eq!(limits.identity_tpd, 20_000);
    }

    #[tokio::test]
    async fn test_admits_never_touch_token_counters() {
        let (_, ledger) = test_ledger();
        let now = test_time();

        for _ in 0..5 {
            assert!(ledger.admit_at("u1", 100, now).await.unwrap().is_allowed());
        }

        let status = ledger.status_at("u1", now).await.unwrap();
        assert_eq!(status.usage.identity_tpd, 0);
        assert_eq!(status.usage.tpd, 0);
        assert_eq!(status.usage.tpm, 0);
        assert_eq!(status.usage.rpm, 5);
    }

    #[tokio::test]
    async fn test_rpm_ceiling_rejects_naming_rpm_without_mutation() {
        let (store, ledger) = test_ledger();
        let now = test_time();

        for _ in 0..30 {
            assert!(ledger.admit_at("u1", 10, now).await.unwrap().is_allowed());
        }

        let before = ledger.status_at("u1", now).await.unwrap().usage;
        let decision = ledger.admit_at("u1", 10, now).await.unwrap();
        let QuotaDecision::Deny { dimension, .. } = decision else {
            panic!("31st request in the minute must be rejected");
        };
        assert_eq!(dimension, LimitDimension::GlobalRequestsPerMinute);

        // Rejection mutates nothing
        let after = ledger.status_at("u1", now).await.unwrap().usage;
        assert_eq!(before, after);
        let rpm_key = LimitDimension::GlobalRequestsPerMinute.counter_key("u1", now);
        assert_eq!(store.get(&rpm_key).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn test_identity_tpd_rejection_names_identity_tpd() {
        let (store, ledger) = test_ledger();
        let now = test_time();

        // Identity u2 has already consumed 19,950 of its 20,000 daily tokens
        let key = LimitDimension::IdentityTokensPerDay.counter_key("u2", now);
        store.increment_by(&key, 19_950, DAY_WINDOW).await.unwrap();

        let decision = ledger.admit_at("u2", 100, now).await.unwrap();
        let QuotaDecision::Deny { dimension, usage, .. } = decision else {
            panic!("admission over the identity token ceiling must be rejected");
        };
        assert_eq!(dimension, LimitDimension::IdentityTokensPerDay);
        assert_eq!(usage.identity_tpd, 19_950);
    }

    #[tokio::test]
    async fn test_precedence_reports_the_earliest_failing_dimension() {
        let (store, ledger) = test_ledger();
        let now = test_time();

        // Both global tpm and identity tpd would fail; global tpm outranks.
        let tpm_key = LimitDimension::GlobalTokensPerMinute.counter_key("u1", now);
        store.increment_by(&tpm_key, 6_000, DAY_WINDOW).await.unwrap();
        let identity_tpd_key = LimitDimension::IdentityTokensPerDay.counter_key("u1", now);
        store
            .increment_by(&identity_tpd_key, 20_000, DAY_WINDOW)
            .await
            .unwrap();

        let decision = ledger.admit_at("u1", 100, now).await.unwrap();
        let QuotaDecision::Deny { dimension, .. } = decision else {
            panic!("admission must be rejected");
        };
        assert_eq!(dimension, LimitDimension::GlobalTokensPerMinute);
    }

    #[tokio::test]
    async fn test_counters_are_monotonic_across_admissions() {
        let (_, ledger) = test_ledger();
        let now = test_time();

        let mut previous = ledger.status_at("u1", now).await.unwrap().usage;
        for _ in 0..10 {
            ledger.admit_at("u1", 10, now).await.unwrap();
            let current = ledger.status_at("u1", now).await.unwrap().usage;
            for dimension in CHECK_PRECEDENCE {
                assert!(current.get(dimension) >= previous.get(dimension));
            }
            previous = current;
        }
    }

    #[tokio::test]
    async fn test_minute_rollover_opens_a_fresh_rpm_bucket() {
        let (_, ledger) = test_ledger();
        let now = test_time();

        for _ in 0..30 {
            assert!(ledger.admit_at("u1", 10, now).await.unwrap().is_allowed());
        }
        // rpm exhausted for this minute; identity rpd (50) still has room
        assert!(!ledger.admit_at("u1", 10, now).await.unwrap().is_allowed());

        let next_minute = now + chrono::Duration::minutes(1);
        let decision = ledger.admit_at("u1", 10, next_minute).await.unwrap();
        let QuotaDecision::Allow { usage, .. } = decision else {
            panic!("the next minute bucket starts empty");
        };
        assert_eq!(usage.rpm, 1);
        // Day-scoped counters carry across the minute boundary
        assert_eq!(usage.rpd, 31);
    }

    #[tokio::test]
    async fn test_grant_raises_effective_identity_ceiling() {
        let (store, ledger) = test_ledger();
        let now = test_time();

        // u1 has 19,950 of its base 20,000 daily tokens consumed, so a
        // 100-token request is over the ceiling
        let key = LimitDimension::IdentityTokensPerDay.counter_key("u1", now);
        store.increment_by(&key, 19_950, DAY_WINDOW).await.unwrap();
        assert!(!ledger.admit_at("u1", 100, now).await.unwrap().is_allowed());

        assert_eq!(ledger.grant_at("u1", 5_000, now).await.unwrap(), 5_000);
        assert_eq!(ledger.grant_at("u1", 1_000, now).await.unwrap(), 6_000);

        let status = ledger.status_at("u1", now).await.unwrap();
        assert_eq!(status.limits.identity_tpd, 26_000);

        assert!(ledger.admit_at("u1", 100, now).await.unwrap().is_allowed());

        // Grants are day-scoped: tomorrow reverts to the base ceiling
        let tomorrow = now + chrono::Duration::days(1);
        let status = ledger.status_at("u1", tomorrow).await.unwrap();
        assert_eq!(status.limits.identity_tpd, 20_000);
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let ledger = QuotaLedger::new(Arc::new(FailingCounterStore), LimitsConfig::default());

        let err = ledger.admit_at("u1", 100, test_time()).await.unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::StoreUnavailable { .. }
        ));
        assert_eq!(ledger.metrics().store_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_status_has_no_side_effects() {
        let (_, ledger) = test_ledger();
        let now = test_time();

        ledger.admit_at("u1", 100, now).await.unwrap();
        let first = ledger.status_at("u1", now).await.unwrap();
        let second = ledger.status_at("u1", now).await.unwrap();

        assert_eq!(first.usage, second.usage);
        assert_eq!(first.remaining.rpm, 29);
        assert_eq!(first.remaining.identity_rpd, 49);
    }

    #[tokio::test]
    async fn test_metrics_track_admissions_and_rejections() {
        let (_, ledger) = test_ledger();
        let now = test_time();

        for _ in 0..30 {
            ledger.admit_at("u1", 10, now).await.unwrap();
        }
        ledger.admit_at("u1", 10, now).await.unwrap();

        assert_eq!(ledger.metrics().admitted.load(Ordering::Relaxed), 30);
        assert_eq!(ledger.metrics().rejected.load(Ordering::Relaxed), 1);
    }
}
