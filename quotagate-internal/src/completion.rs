//! Downstream completion API boundary.
//!
//! The gateway only needs a narrow slice of the provider surface: send
//! messages to a model chosen by tier, get content back, and surface the
//! provider's actual token usage when it reports one. Everything else
//! (streaming, tool calls, multi-choice) is out of scope.

use async_trait::async_trait;
use axum::http::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::selector::ModelTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub tier: ModelTier,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    /// Actual consumption as reported by the provider. Absent when the
    /// provider omits usage data; the router then falls back to its estimate.
    pub usage: Option<CompletionUsage>,
}

#[async_trait]
pub trait CompletionClient: Send + Sync + std::fmt::Debug {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error>;
}

/// OpenAI-compatible chat completions wire format
#[derive(Debug, Serialize)]
struct ProviderRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    model: String,
    choices: Vec<ProviderChoice>,
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct ProviderChoice {
    message: ProviderMessage,
}

#[derive(Debug, Deserialize)]
struct ProviderMessage {
    content: String,
}

/// HTTP client for an OpenAI-compatible completion provider.
///
/// The credential is mandatory at construction; there is no unauthenticated
/// fallback. Transport and provider errors both map to `DownstreamCallFailed`
/// with the raw provider response kept for logs only.
#[derive(Debug)]
pub struct HttpCompletionClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    primary_model: String,
    degraded_model: String,
}

impl HttpCompletionClient {
    pub fn new(
        http_client: reqwest::Client,
        base_url: String,
        api_key: SecretString,
        primary_model: String,
        degraded_model: String,
    ) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            primary_model,
            degraded_model,
        }
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Primary => &self.primary_model,
            ModelTier::Degraded => &self.degraded_model,
        }
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let model = self.model_for(request.tier);
        let body = ProviderRequest {
            model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::DownstreamCallFailed {
                    message: format!("Error sending request to provider: {e}"),
                    status_code: None,
                    raw_response: None,
                })
            })?;

        let status = response.status();
        if !status.is_success() {
            let raw_response = response.text().await.ok();
            return Err(Error::new(ErrorDetails::DownstreamCallFailed {
                message: "Provider returned an error status".to_string(),
                status_code: StatusCode::from_u16(status.as_u16()).ok(),
                raw_response,
            }));
        }

        let parsed: ProviderResponse = response.json().await.map_err(|e| {
            Error::new(ErrorDetails::DownstreamCallFailed {
                message: format!("Error parsing provider response: {e}"),
                status_code: None,
                raw_response: None,
            })
        })?;

        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(Error::new(ErrorDetails::DownstreamCallFailed {
                message: "Provider response contained no choices".to_string(),
                status_code: None,
                raw_response: None,
            }));
        };

        Ok(CompletionResponse {
            content: choice.message.content,
            model: parsed.model,
            usage: parsed.usage,
        })
    }
}

/// Deterministic in-process client for tests and local runs.
#[derive(Debug)]
pub struct DummyCompletionClient {
    include_usage: bool,
}

impl DummyCompletionClient {
    pub fn new() -> Self {
        Self {
            include_usage: true,
        }
    }

    /// A dummy that mimics providers which omit usage data, forcing the
    /// router to fall back to its estimate.
    pub fn without_usage() -> Self {
        Self {
            include_usage: false,
        }
    }
}

impl Default for DummyCompletionClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionClient for DummyCompletionClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let model = match request.tier {
            ModelTier::Primary => "dummy-primary",
            ModelTier::Degraded => "dummy-degraded",
        };

        let prompt_tokens: u64 = request
            .messages
            .iter()
            .map(|message| message.content.split_whitespace().count() as u64)
            .sum();
        let content = format!("Dummy completion from the {} tier", request.tier);
        let completion_tokens = 7;

        Ok(CompletionResponse {
            content,
            model: model.to_string(),
            usage: self.include_usage.then_some(CompletionUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
        })
    }
}
