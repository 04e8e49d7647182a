//! Time-bucket key derivation.
//!
//! Counters are scoped to wall-clock UTC buckets and roll over purely by key
//! change: the ledger never resets a counter, it just stops deriving the old
//! key and lets the store expire it. Keys follow the convention
//! `{scope}:{dimension}:{identity-or-empty}:{timeBucket}` and are opaque to
//! the store.

use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::quota::LimitDimension;

pub const MINUTE_WINDOW: Duration = Duration::from_secs(60);
pub const DAY_WINDOW: Duration = Duration::from_secs(86_400);

/// Minute-granularity bucket, e.g. `2024-1-1-10-30`. Fields are unpadded, so
/// keys are not lexically sortable; nothing ever sorts them.
pub fn minute_bucket(now: DateTime<Utc>) -> String {
    format!(
        "{}-{}-{}-{}-{}",
        now.year(),
        now.month(),
        now.day(),
        now.hour(),
        now.minute()
    )
}

/// Day-granularity bucket, e.g. `2024-1-1`.
pub fn day_bucket(now: DateTime<Utc>) -> String {
    format!("{}-{}-{}", now.year(), now.month(), now.day())
}

/// Assemble a counter key. The identity segment is empty for global scope.
pub fn counter_key(scope: &str, dimension: &str, identity: &str, bucket: &str) -> String {
    format!("{scope}:{dimension}:{identity}:{bucket}")
}

impl LimitDimension {
    /// The store key for this dimension's counter at time `now`. Global
    /// dimensions ignore `identity`.
    pub fn counter_key(&self, identity: &str, now: DateTime<Utc>) -> String {
        match self {
            LimitDimension::GlobalRequestsPerMinute => {
                counter_key("global", "rpm", "", &minute_bucket(now))
            }
            LimitDimension::GlobalRequestsPerDay => {
                counter_key("global", "rpd", "", &day_bucket(now))
            }
            LimitDimension::GlobalTokensPerMinute => {
                counter_key("global", "tpm", "", &minute_bucket(now))
            }
            LimitDimension::GlobalTokensPerDay => {
                counter_key("global", "tpd", "", &day_bucket(now))
            }
            LimitDimension::IdentityRequestsPerDay => {
                counter_key("identity", "rpd", identity, &day_bucket(now))
            }
            LimitDimension::IdentityTokensPerDay => {
                counter_key("identity", "tpd", identity, &day_bucket(now))
            }
        }
    }
}

/// Key for an identity's day-bucketed token-grant counter. Grants raise the
/// identity's effective tokens-per-day ceiling for the current day.
pub fn grant_counter_key(identity: &str, now: DateTime<Utc>) -> String {
    counter_key("identity", "grant", identity, &day_bucket(now))
}

/// Unix timestamp at which the current window of the given length rolls over:
/// the next minute boundary for minute windows, the next UTC midnight for day
/// windows. Used for X-RateLimit-Reset / Retry-After reporting.
pub fn window_reset_unix(window: Duration, now: DateTime<Utc>) -> u64 {
    let window_seconds = window.as_secs() as i64;
    let timestamp = now.timestamp();
    (timestamp - timestamp.rem_euclid(window_seconds) + window_seconds) as u64
}
