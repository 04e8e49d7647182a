//! Quota status and token-grant endpoints.
//!
//! Grants are pure bookkeeping: receipt verification against the storefront
//! and ad-reward validation happen upstream, and by the time a request lands
//! here the only job left is crediting tokens to the identity.

use axum::extract::{Path, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppState;
use crate::quota::QuotaFigures;

#[derive(Debug, Serialize)]
pub struct QuotaStatusBody {
    pub identity: String,
    pub usage: QuotaFigures,
    pub limits: QuotaFigures,
    pub remaining: QuotaFigures,
}

/// Read-only snapshot for one identity. No side effects.
pub async fn quota_status_handler(
    State(state): AppState,
    Path(identity): Path<String>,
) -> Result<Json<QuotaStatusBody>, Error> {
    let status = state.ledger.status(&identity).await?;
    Ok(Json(QuotaStatusBody {
        identity,
        usage: status.usage,
        limits: status.limits,
        remaining: status.remaining,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantSource {
    Purchase,
    AdReward,
}

#[derive(Debug, Deserialize)]
pub struct GrantParams {
    pub tokens: u64,
    pub source: GrantSource,
    /// Upstream reference (receipt id, ad impression id); logged, not stored
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GrantResponseBody {
    pub identity: String,
    pub source: GrantSource,
    pub tokens_granted: u64,
    pub granted_today: u64,
}

pub async fn grant_handler(
    State(state): AppState,
    Path(identity): Path<String>,
    Json(params): Json<GrantParams>,
) -> Result<Json<GrantResponseBody>, Error> {
    if params.tokens == 0 {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: "`tokens` must be greater than zero".to_string(),
        }));
    }

    tracing::info!(
        identity = identity.as_str(),
        source = ?params.source,
        reference = params.reference.as_deref().unwrap_or("-"),
        tokens = params.tokens,
        "Processing token grant"
    );

    let granted_today = state.ledger.grant(&identity, params.tokens).await?;
    Ok(Json(GrantResponseBody {
        identity,
        source: params.source,
        tokens_granted: params.tokens,
        granted_today,
    }))
}
