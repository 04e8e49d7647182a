//! Model tier selection with hysteresis.
//!
//! Near the trip threshold a naive comparison flaps between tiers on every
//! counter tick. The selector instead pins the degraded tier for a cooldown
//! window once tripped, and leaves fallback mode only when load falls below a
//! separate, lower recovery threshold.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::counter_store::CounterStore;
use crate::error::{Error, ErrorDetails};
use crate::quota::config::GlobalLimitsConfig;
use crate::quota::{LimitDimension, QuotaFigures};

/// A downstream processing tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Primary,
    Degraded,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Primary => "primary",
            ModelTier::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for tier selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Load fraction above which the degraded tier is forced
    #[serde(default = "default_trip_threshold")]
    pub trip_threshold: f64,

    /// Load fraction below which fallback mode may be left
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: f64,

    /// How long the degraded tier is pinned after a trip, in seconds
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
}

fn default_trip_threshold() -> f64 {
    0.70
}

fn default_recovery_threshold() -> f64 {
    0.50
}

fn default_cooldown_seconds() -> u64 {
    300
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            trip_threshold: default_trip_threshold(),
            recovery_threshold: default_recovery_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
        }
    }
}

impl SelectorConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.trip_threshold > 0.0 && self.trip_threshold <= 1.0) {
            return Err(Error::new(ErrorDetails::Config {
                message: "`selector.trip_threshold` must be in (0, 1]".to_string(),
            }));
        }
        if self.recovery_threshold >= self.trip_threshold || self.recovery_threshold <= 0.0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`selector.recovery_threshold` must be positive and below the trip threshold"
                    .to_string(),
            }));
        }
        if self.cooldown_seconds == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`selector.cooldown_seconds` must be greater than zero".to_string(),
            }));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }
}

/// Metrics for selector behavior monitoring
#[derive(Debug, Default)]
pub struct SelectorMetrics {
    pub trips: std::sync::atomic::AtomicU64,
    pub holds: std::sync::atomic::AtomicU64,
    pub recoveries: std::sync::atomic::AtomicU64,
}

impl SelectorMetrics {
    pub fn record_trip(&self) {
        self.trips.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_hold(&self) {
        self.holds.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_recovery(&self) {
        self.recoveries
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Chooses the downstream tier from the current global load.
///
/// The fallback deadline is the only mutable state. It is a single atomically
/// swapped value: readers always see a committed deadline, and last-writer-
/// wins on concurrent trips is acceptable because the gate is advisory for
/// tier choice, not for quota correctness.
pub struct ModelSelector {
    store: Arc<dyn CounterStore>,
    global_limits: GlobalLimitsConfig,
    config: SelectorConfig,
    fallback_until: ArcSwapOption<Instant>,
    metrics: Arc<SelectorMetrics>,
}

impl ModelSelector {
    pub fn new(
        store: Arc<dyn CounterStore>,
        global_limits: GlobalLimitsConfig,
        config: SelectorConfig,
    ) -> Self {
        Self {
            store,
            global_limits,
            config,
            fallback_until: ArcSwapOption::empty(),
            metrics: Arc::new(SelectorMetrics::default()),
        }
    }

    pub fn metrics(&self) -> &SelectorMetrics {
        &self.metrics
    }

    /// Select a tier by reading the global counters.
    pub async fn select(&self, preferred: Option<ModelTier>) -> Result<ModelTier, Error> {
        let now = Utc::now();
        let tpd_key = LimitDimension::GlobalTokensPerDay.counter_key("", now);
        let rpm_key = LimitDimension::GlobalRequestsPerMinute.counter_key("", now);
        let (tpd, rpm) = tokio::try_join!(self.store.get(&tpd_key), self.store.get(&rpm_key))?;

        let usage = QuotaFigures {
            tpd,
            rpm,
            ..Default::default()
        };
        Ok(self.select_with_usage(&usage, preferred))
    }

    /// Select a tier from an already-read usage snapshot. The router uses
    /// this with the admission snapshot to avoid a second round of reads.
    pub fn select_with_usage(
        &self,
        usage: &QuotaFigures,
        preferred: Option<ModelTier>,
    ) -> ModelTier {
        self.select_with_usage_at(usage, preferred, Instant::now())
    }

    fn select_with_usage_at(
        &self,
        usage: &QuotaFigures,
        preferred: Option<ModelTier>,
        now: Instant,
    ) -> ModelTier {
        let tpd_fraction = fraction(usage.tpd, self.global_limits.tokens_per_day);
        let rpm_fraction = fraction(usage.rpm, self.global_limits.requests_per_minute);

        // Hysteresis hold: a live deadline wins over the instantaneous load
        if let Some(deadline) = self.fallback_until.load_full() {
            if *deadline > now {
                self.metrics.record_hold();
                return ModelTier::Degraded;
            }
        }

        if tpd_fraction > self.config.trip_threshold || rpm_fraction > self.config.trip_threshold {
            self.fallback_until
                .store(Some(Arc::new(now + self.config.cooldown())));
            self.metrics.record_trip();
            tracing::warn!(
                tpd_fraction = tpd_fraction,
                rpm_fraction = rpm_fraction,
                cooldown_seconds = self.config.cooldown_seconds,
                "Load crossed the trip threshold; pinning the degraded tier"
            );
            return ModelTier::Degraded;
        }

        if tpd_fraction < self.config.recovery_threshold
            && rpm_fraction < self.config.recovery_threshold
            && self.fallback_until.load().is_some()
        {
            self.fallback_until.store(None);
            self.metrics.record_recovery();
            tracing::info!("Load fell below the recovery threshold; leaving fallback mode");
        }

        preferred.unwrap_or(ModelTier::Primary)
    }
}

fn fraction(usage: u64, limit: u64) -> f64 {
    if limit == 0 {
        0.0
    } else {
        usage as f64 / limit as f64
    }
}
