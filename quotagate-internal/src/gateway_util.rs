//! Shared application state and component wiring.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use crate::completion::{CompletionClient, DummyCompletionClient, HttpCompletionClient};
use crate::config_parser::{Config, ProviderConfig, StoreConfig};
use crate::counter_store::{CounterStore, InMemoryCounterStore, RedisCounterStore};
use crate::error::{Error, ErrorDetails};
use crate::quota::{QuotaLedger, UsageReconciler};
use crate::selector::ModelSelector;

#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub ledger: Arc<QuotaLedger>,
    pub reconciler: Arc<UsageReconciler>,
    pub selector: Arc<ModelSelector>,
    pub completion_client: Arc<dyn CompletionClient>,
}

pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let store = setup_counter_store(&config.store).await?;
        let completion_client = setup_completion_client(&config.provider)?;

        let ledger = Arc::new(QuotaLedger::new(store.clone(), config.limits.clone()));
        let reconciler = Arc::new(UsageReconciler::new(store.clone()));
        let selector = Arc::new(ModelSelector::new(
            store,
            config.limits.global.clone(),
            config.selector.clone(),
        ));

        Ok(Self {
            config,
            ledger,
            reconciler,
            selector,
            completion_client,
        })
    }
}

pub async fn setup_counter_store(config: &StoreConfig) -> Result<Arc<dyn CounterStore>, Error> {
    match config {
        StoreConfig::Memory => {
            tracing::info!("Using the in-memory counter store");
            Ok(Arc::new(InMemoryCounterStore::new()))
        }
        StoreConfig::Redis { url } => {
            let store = RedisCounterStore::new(url).await?;
            tracing::info!("Connected to Redis counter store");
            Ok(Arc::new(store))
        }
    }
}

pub fn setup_completion_client(config: &ProviderConfig) -> Result<Arc<dyn CompletionClient>, Error> {
    match config {
        ProviderConfig::Dummy => {
            tracing::info!("Using the dummy completion provider");
            Ok(Arc::new(DummyCompletionClient::new()))
        }
        ProviderConfig::OpenAi {
            base_url,
            api_key_env,
            primary_model,
            degraded_model,
        } => {
            // A missing credential is a hard refusal, never a silent
            // unauthenticated client.
            let api_key = std::env::var(api_key_env)
                .map(SecretString::from)
                .map_err(|_| {
                    Error::new(ErrorDetails::ConfigurationMissing {
                        field: api_key_env.clone(),
                    })
                })?;
            Ok(Arc::new(HttpCompletionClient::new(
                setup_http_client()?,
                base_url.clone(),
                api_key,
                primary_model.clone(),
                degraded_model.clone(),
            )))
        }
    }
}

pub fn setup_http_client() -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .map_err(|e| {
            Error::new(ErrorDetails::InternalError {
                message: format!("Failed to build HTTP client: {e}"),
            })
        })
}
