pub mod bucket;
pub mod config;
pub mod ledger;
pub mod reconciler;

pub use config::{GlobalLimitsConfig, IdentityLimitsConfig, LimitsConfig};
pub use ledger::QuotaLedger;
pub use reconciler::UsageReconciler;

use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

/// A single enforced limit dimension. The serialized name doubles as the
/// machine-readable rejection reason, so renames here are a wire change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitDimension {
    #[serde(rename = "global_rpm")]
    GlobalRequestsPerMinute,
    #[serde(rename = "global_rpd")]
    GlobalRequestsPerDay,
    #[serde(rename = "global_tpm")]
    GlobalTokensPerMinute,
    #[serde(rename = "global_tpd")]
    GlobalTokensPerDay,
    #[serde(rename = "identity_rpd")]
    IdentityRequestsPerDay,
    #[serde(rename = "identity_tpd")]
    IdentityTokensPerDay,
}

/// Admission precedence. Dimensions are evaluated in this order and the first
/// failure short-circuits, so a request that trips several limits always
/// reports the same one. Global dimensions outrank per-identity dimensions.
pub const CHECK_PRECEDENCE: [LimitDimension; 6] = [
    LimitDimension::GlobalRequestsPerMinute,
    LimitDimension::GlobalRequestsPerDay,
    LimitDimension::GlobalTokensPerMinute,
    LimitDimension::GlobalTokensPerDay,
    LimitDimension::IdentityRequestsPerDay,
    LimitDimension::IdentityTokensPerDay,
];

impl LimitDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitDimension::GlobalRequestsPerMinute => "global_rpm",
            LimitDimension::GlobalRequestsPerDay => "global_rpd",
            LimitDimension::GlobalTokensPerMinute => "global_tpm",
            LimitDimension::GlobalTokensPerDay => "global_tpd",
            LimitDimension::IdentityRequestsPerDay => "identity_rpd",
            LimitDimension::IdentityTokensPerDay => "identity_tpd",
        }
    }

    /// Token dimensions are checked against `current + estimate` and only ever
    /// mutated by the reconciler; request dimensions are checked against
    /// `current + 1` and incremented at admission time.
    pub fn counts_tokens(&self) -> bool {
        matches!(
            self,
            LimitDimension::GlobalTokensPerMinute
                | LimitDimension::GlobalTokensPerDay
                | LimitDimension::IdentityTokensPerDay
        )
    }

    /// The active lifetime of a counter in this dimension, which is also the
    /// expiry applied when one of its keys is created.
    pub fn window(&self) -> Duration {
        match self {
            LimitDimension::GlobalRequestsPerMinute | LimitDimension::GlobalTokensPerMinute => {
                bucket::MINUTE_WINDOW
            }
            LimitDimension::GlobalRequestsPerDay
            | LimitDimension::GlobalTokensPerDay
            | LimitDimension::IdentityRequestsPerDay
            | LimitDimension::IdentityTokensPerDay => bucket::DAY_WINDOW,
        }
    }
}

impl std::fmt::Display for LimitDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per limit dimension. Used for usage snapshots, effective limit
/// sets, and remaining-quota figures alike; the semantics come from context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaFigures {
    pub rpm: u64,
    pub rpd: u64,
    pub tpm: u64,
    pub tpd: u64,
    pub identity_rpd: u64,
    pub identity_tpd: u64,
}

impl QuotaFigures {
    pub fn get(&self, dimension: LimitDimension) -> u64 {
        match dimension {
            LimitDimension::GlobalRequestsPerMinute => self.rpm,
            LimitDimension::GlobalRequestsPerDay => self.rpd,
            LimitDimension::GlobalTokensPerMinute => self.tpm,
            LimitDimension::GlobalTokensPerDay => self.tpd,
            LimitDimension::IdentityRequestsPerDay => self.identity_rpd,
            LimitDimension::IdentityTokensPerDay => self.identity_tpd,
        }
    }

    pub fn set(&mut self, dimension: LimitDimension, value: u64) {
        match dimension {
            LimitDimension::GlobalRequestsPerMinute => self.rpm = value,
            LimitDimension::GlobalRequestsPerDay => self.rpd = value,
            LimitDimension::GlobalTokensPerMinute => self.tpm = value,
            LimitDimension::GlobalTokensPerDay => self.tpd = value,
            LimitDimension::IdentityRequestsPerDay => self.identity_rpd = value,
            LimitDimension::IdentityTokensPerDay => self.identity_tpd = value,
        }
    }

    /// Usage after charging `tokens` to every token dimension. Used by the
    /// router to adjust the admission-time snapshot for the request it just
    /// served before reporting remaining quota.
    pub fn with_tokens_added(&self, tokens: u64) -> QuotaFigures {
        QuotaFigures {
            tpm: self.tpm + tokens,
            tpd: self.tpd + tokens,
            identity_tpd: self.identity_tpd + tokens,
            ..*self
        }
    }

    /// Treating `self` as a limit set, the headroom left over `usage`.
    pub fn remaining(&self, usage: &QuotaFigures) -> QuotaFigures {
        QuotaFigures {
            rpm: self.rpm.saturating_sub(usage.rpm),
            rpd: self.rpd.saturating_sub(usage.rpd),
            tpm: self.tpm.saturating_sub(usage.tpm),
            tpd: self.tpd.saturating_sub(usage.tpd),
            identity_rpd: self.identity_rpd.saturating_sub(usage.identity_rpd),
            identity_tpd: self.identity_tpd.saturating_sub(usage.identity_tpd),
        }
    }
}

/// Result of an admission check
#[derive(Debug)]
pub enum QuotaDecision {
    Allow {
        usage: QuotaFigures,
        limits: QuotaFigures,
    },
    Deny {
        dimension: LimitDimension,
        usage: QuotaFigures,
        limits: QuotaFigures,
    },
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allow { .. })
    }

    pub fn usage(&self) -> &QuotaFigures {
        match self {
            QuotaDecision::Allow { usage, .. } | QuotaDecision::Deny { usage, .. } => usage,
        }
    }

    pub fn limits(&self) -> &QuotaFigures {
        match self {
            QuotaDecision::Allow { limits, .. } | QuotaDecision::Deny { limits, .. } => limits,
        }
    }
}

/// Read-only quota snapshot for dashboards and diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub usage: QuotaFigures,
    pub limits: QuotaFigures,
    pub remaining: QuotaFigures,
}

/// Headers returned with quota information
#[derive(Debug, Clone)]
pub struct QuotaHeaders {
    pub limit: u64,
    pub remaining: u64,
    pub reset: u64,              // Unix timestamp
    pub retry_after: Option<u64>, // Seconds
}

impl QuotaHeaders {
    /// Headers describing one dimension of a snapshot: the rpm dimension on
    /// successful responses, or the dimension that tripped on rejections.
    pub fn for_dimension(
        dimension: LimitDimension,
        usage: &QuotaFigures,
        limits: &QuotaFigures,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        let reset = bucket::window_reset_unix(dimension.window(), now);
        QuotaHeaders {
            limit: limits.get(dimension),
            remaining: limits.get(dimension).saturating_sub(usage.get(dimension)),
            reset,
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, now: chrono::DateTime<chrono::Utc>) -> Self {
        self.retry_after = Some((self.reset as i64 - now.timestamp()).max(0) as u64);
        self
    }

    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        // These conversions are safe because we're converting numbers to strings.
        // Numbers always produce valid header values.
        if let Ok(value) = HeaderValue::from_str(&self.limit.to_string()) {
            headers.insert("X-RateLimit-Limit", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.remaining.to_string()) {
            headers.insert("X-RateLimit-Remaining", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.reset.to_string()) {
            headers.insert("X-RateLimit-Reset", value);
        }

        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                headers.insert("Retry-After", value);
            }
        }

        headers
    }
}

/// Metrics for ledger performance monitoring
#[derive(Debug, Default)]
pub struct LedgerMetrics {
    pub admitted: std::sync::atomic::AtomicU64,
    pub rejected: std::sync::atomic::AtomicU64,
    pub store_errors: std::sync::atomic::AtomicU64,
}

impl LedgerMetrics {
    pub fn record_admitted(&self) {
        self.admitted
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}
