//! Gateway configuration file handling.
//!
//! Configuration is a TOML file loaded once at startup and validated into an
//! immutable `Config`. Limits and thresholds are fixed for the process
//! lifetime; changing them means restarting the gateway.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::quota::LimitsConfig;
use crate::selector::SelectorConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub selector: SelectorConfig,

    #[serde(default)]
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Socket address to bind; defaults to 0.0.0.0:3000 when unset
    pub bind_address: Option<SocketAddr>,
}

/// Counter store backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    /// In-process store: single-node deployments and tests
    Memory,
    /// Redis: shared counters across gateway replicas
    Redis { url: String },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory
    }
}

/// Downstream completion provider selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Deterministic in-process provider for tests and local runs
    Dummy,
    /// Any OpenAI-compatible chat completions endpoint
    #[serde(rename = "openai")]
    OpenAi {
        #[serde(default = "default_base_url")]
        base_url: String,

        /// Environment variable holding the provider credential. The
        /// credential itself never appears in the config file.
        #[serde(default = "default_api_key_env")]
        api_key_env: String,

        primary_model: String,
        degraded_model: String,
    },
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "QUOTAGATE_API_KEY".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig::Dummy
    }
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Config, Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::FileRead {
                message: e.to_string(),
                file_path: path.to_string_lossy().to_string(),
            })
        })?;
        Self::load_from_str(&raw)
    }

    pub fn load_from_str(raw: &str) -> Result<Config, Error> {
        let config: Config = toml::from_str(raw).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file: {e}"),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        self.limits.validate()?;
        self.selector.validate()?;
        if let ProviderConfig::OpenAi {
            primary_model,
            degraded_model,
            ..
        } = &self.provider
        {
            if primary_model.is_empty() || degraded_model.is_empty() {
                return Err(Error::new(ErrorDetails::Config {
                    message: "`provider.primary_model` and `provider.degraded_model` must be non-empty"
                        .to_string(),
                }));
            }
        }
        Ok(())
    }
}
