use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::quota::QuotaFigures;

/// Ceilings shared by every identity. Fixed for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalLimitsConfig {
    /// Requests admitted per minute across all identities
    #[serde(default = "default_global_rpm")]
    pub requests_per_minute: u64,

    /// Requests admitted per day across all identities
    #[serde(default = "default_global_rpd")]
    pub requests_per_day: u64,

    /// Tokens consumed per minute across all identities
    #[serde(default = "default_global_tpm")]
    pub tokens_per_minute: u64,

    /// Tokens consumed per day across all identities
    #[serde(default = "default_global_tpd")]
    pub tokens_per_day: u64,
}

fn default_global_rpm() -> u64 {
    30
}

fn default_global_rpd() -> u64 {
    14_400
}

fn default_global_tpm() -> u64 {
    6_000
}

fn default_global_tpd() -> u64 {
    500_000
}

impl Default for GlobalLimitsConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_global_rpm(),
            requests_per_day: default_global_rpd(),
            tokens_per_minute: default_global_tpm(),
            tokens_per_day: default_global_tpd(),
        }
    }
}

/// Ceilings applied to each identity separately. Token grants raise the
/// effective tokens-per-day ceiling above `tokens_per_day` for the day they
/// are credited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityLimitsConfig {
    /// Requests admitted per day for one identity
    #[serde(default = "default_identity_rpd")]
    pub requests_per_day: u64,

    /// Base tokens per day for one identity, before grants
    #[serde(default = "default_identity_tpd")]
    pub tokens_per_day: u64,
}

fn default_identity_rpd() -> u64 {
    50
}

fn default_identity_tpd() -> u64 {
    20_000
}

impl Default for IdentityLimitsConfig {
    fn default() -> Self {
        Self {
            requests_per_day: default_identity_rpd(),
            tokens_per_day: default_identity_tpd(),
        }
    }
}

/// The two limit hierarchies together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default)]
    pub global: GlobalLimitsConfig,

    #[serde(default)]
    pub identity: IdentityLimitsConfig,
}

impl LimitsConfig {
    /// Every ceiling must be positive: a zero limit would make the fraction
    /// arithmetic in the selector meaningless and reject all traffic anyway.
    pub fn validate(&self) -> Result<(), Error> {
        let ceilings = [
            ("limits.global.requests_per_minute", self.global.requests_per_minute),
            ("limits.global.requests_per_day", self.global.requests_per_day),
            ("limits.global.tokens_per_minute", self.global.tokens_per_minute),
            ("limits.global.tokens_per_day", self.global.tokens_per_day),
            ("limits.identity.requests_per_day", self.identity.requests_per_day),
            ("limits.identity.tokens_per_day", self.identity.tokens_per_day),
        ];
        for (name, ceiling) in ceilings {
            if ceiling == 0 {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!("`{name}` must be greater than zero"),
                }));
            }
        }
        Ok(())
    }

    /// The effective limit set for one identity, with today's token grants
    /// folded into the identity tokens-per-day ceiling.
    pub fn effective(&self, granted_today: u64) -> QuotaFigures {
        QuotaFigures {
            rpm: self.global.requests_per_minute,
            rpd: self.global.requests_per_day,
            tpm: self.global.tokens_per_minute,
            tpd: self.global.tokens_per_day,
            identity_rpd: self.identity.requests_per_day,
            identity_tpd: self.identity.tokens_per_day + granted_today,
        }
    }
}
