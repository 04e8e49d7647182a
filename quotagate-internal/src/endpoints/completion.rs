//! The completion request router.
//!
//! Sequences admission, tier selection, the downstream call, and usage
//! reconciliation. The quota engine underneath never sees HTTP; this handler
//! owns all response shaping.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::completion::{ChatMessage, CompletionRequest};
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppState;
use crate::quota::{LimitDimension, QuotaDecision, QuotaFigures, QuotaHeaders};
use crate::selector::ModelTier;

pub const IDENTITY_HEADER: &str = "x-quotagate-identity";

#[derive(Debug, Deserialize)]
pub struct CompletionParams {
    /// Identity under which quota is tracked; the `x-quotagate-identity`
    /// header is the fallback.
    #[serde(default)]
    pub user: Option<String>,

    pub messages: Vec<ChatMessage>,

    /// Caller tier preference, honored only when no fallback condition holds
    #[serde(default)]
    pub tier: Option<ModelTier>,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponseBody {
    pub id: Uuid,
    pub content: String,
    pub model: String,
    pub tier: ModelTier,
    pub tokens_used: u64,
    pub remaining: QuotaFigures,
}

pub async fn completion_handler(
    State(state): AppState,
    headers: HeaderMap,
    Json(params): Json<CompletionParams>,
) -> Result<Response, Error> {
    let identity = resolve_identity(params.user.as_deref(), &headers)?;
    if params.messages.is_empty() {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: "`messages` must not be empty".to_string(),
        }));
    }

    let estimated_tokens = estimate_tokens(&params.messages);

    // A store failure propagates here and fails closed as a 503
    let decision = state.ledger.admit(&identity, estimated_tokens).await?;
    let (usage, limits) = match decision {
        QuotaDecision::Deny {
            dimension,
            usage,
            limits,
        } => return Ok(deny_response(dimension, &usage, &limits)),
        QuotaDecision::Allow { usage, limits } => (usage, limits),
    };

    // Reuse the admission snapshot instead of re-reading the counters
    let tier = state.selector.select_with_usage(&usage, params.tier);

    let completion = state
        .completion_client
        .complete(CompletionRequest {
            messages: params.messages,
            tier,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        })
        .await?;

    let actual_tokens = completion
        .usage
        .as_ref()
        .map(|usage| usage.total_tokens)
        .unwrap_or(estimated_tokens);

    // The response was already produced; a lost token record is the tolerated
    // gap, re-rejecting the request is not an option.
    if let Err(e) = state.reconciler.record(&identity, actual_tokens).await {
        tracing::warn!(
            identity = identity.as_str(),
            "Failed to record actual token usage: {e}"
        );
    }

    let adjusted_usage = usage.with_tokens_added(actual_tokens);
    let quota_headers = QuotaHeaders::for_dimension(
        LimitDimension::GlobalRequestsPerMinute,
        &adjusted_usage,
        &limits,
        Utc::now(),
    );
    let body = CompletionResponseBody {
        id: Uuid::now_v7(),
        content: completion.content,
        model: completion.model,
        tier,
        tokens_used: actual_tokens,
        remaining: limits.remaining(&adjusted_usage),
    };

    Ok((StatusCode::OK, quota_headers.to_header_map(), Json(body)).into_response())
}

/// 429 with the tripped dimension as a machine-readable reason plus the full
/// quota figures, so clients can back off intelligently.
fn deny_response(
    dimension: LimitDimension,
    usage: &QuotaFigures,
    limits: &QuotaFigures,
) -> Response {
    let now = Utc::now();
    let error = Error::new(ErrorDetails::LimitExceeded { dimension });
    let quota_headers =
        QuotaHeaders::for_dimension(dimension, usage, limits, now).with_retry_after(now);

    let body = json!({
        "error": {
            "message": error.to_string(),
            "type": "limit_exceeded",
            "reason": dimension,
        },
        "usage": usage,
        "limits": limits,
        "remaining": limits.remaining(usage),
    });

    (error.status_code(), quota_headers.to_header_map(), Json(body)).into_response()
}

fn resolve_identity(user: Option<&str>, headers: &HeaderMap) -> Result<String, Error> {
    if let Some(user) = user {
        if !user.is_empty() {
            return Ok(user.to_string());
        }
    }

    if let Some(identity) = headers
        .get(IDENTITY_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        if !identity.is_empty() {
            return Ok(identity.to_string());
        }
    }

    Err(Error::new(ErrorDetails::InvalidRequest {
        message: format!(
            "An identity is required: set the `user` field or the `{IDENTITY_HEADER}` header"
        ),
    }))
}

/// Pessimistic token estimate from the request payload: roughly 0.75 tokens
/// per whitespace-delimited word, rounded up. An approximation, not a
/// tokenizer; the reconciler replaces it with the provider's actual figure.
pub fn estimate_tokens(messages: &[ChatMessage]) -> u64 {
    let words: u64 = messages
        .iter()
        .map(|message| message.content.split_whitespace().count() as u64)
        .sum();
    (words * 3).div_ceil(4)
}
