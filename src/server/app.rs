//! HTTP server setup and configuration.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use reqwest::Client;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use super::{auth, handlers};
use crate::adapter::{AdapterRegistry, EchoAdapter, OpenAiCompatAdapter, ProviderAdapter};
use crate::config::Config;
use crate::credentials::ApiKey;
use crate::dispatch::{builtin_callback, AlertSink, Alerter, Callbacks, Dispatcher, LogAlertSink};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub master_key: Option<ApiKey>,
    pub max_concurrent_requests: Option<usize>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            master_key: None,
            max_concurrent_requests: None,
        }
    }

    pub fn with_master_key(mut self, master_key: Option<ApiKey>) -> Self {
        self.master_key = master_key;
        self
    }

    pub fn with_concurrency_limit(mut self, limit: Option<usize>) -> Self {
        self.max_concurrent_requests = limit;
        self
    }
}

/// One adapter per provider id named in the configuration.
///
/// `echo` gets the built-in echo adapter; every other provider is assumed to
/// speak the OpenAI chat-completions protocol at its `options.base_url`.
pub fn build_adapters(config: &Config, client: &Client) -> AdapterRegistry {
    let provider_ids: BTreeSet<&str> = config.models.iter().map(|m| m.provider.as_str()).collect();

    provider_ids
        .into_iter()
        .fold(AdapterRegistry::new(), |adapters, provider_id| {
            let adapter: Arc<dyn ProviderAdapter> = match provider_id {
                "echo" => Arc::new(EchoAdapter::new(provider_id)),
                "openai" => Arc::new(
                    OpenAiCompatAdapter::new(provider_id, client.clone())
                        .with_base_url(OPENAI_BASE_URL),
                ),
                _ => Arc::new(OpenAiCompatAdapter::new(provider_id, client.clone())),
            };
            tracing::debug!(provider = provider_id, "Registered adapter");
            adapters.with(adapter)
        })
}

/// Build the dispatcher, starting the alert and callback workers.
///
/// Must be called inside a tokio runtime.
pub fn build_dispatcher(config: &Config) -> anyhow::Result<Dispatcher> {
    // Per-candidate deadlines are enforced by the dispatcher, not the client
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let router = config.router()?;
    let adapters = build_adapters(config, &client);

    let alerter = if config.alerting.enabled {
        let sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogAlertSink)];
        Alerter::spawn(
            sinks,
            config.alerting.events.iter().copied(),
            config.alerting.queue_capacity,
        )
    } else {
        Alerter::disabled()
    };

    let callbacks = Callbacks::spawn(
        config
            .callbacks
            .success
            .iter()
            .filter_map(|name| builtin_callback(name))
            .collect(),
        config
            .callbacks
            .failure
            .iter()
            .filter_map(|name| builtin_callback(name))
            .collect(),
        config.callbacks.queue_capacity,
    );

    Ok(Dispatcher::new(Arc::new(router), adapters)
        .with_settings(config.dispatch.settings())
        .with_alerter(alerter)
        .with_callbacks(callbacks))
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    let limit = state.max_concurrent_requests;
    let router = Router::new()
        // OpenAI-compatible endpoints
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        .route("/health", get(handlers::health))
        // State and middleware
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_master_key,
        ))
        .with_state(state);

    // One semaphore shared by every route; excess requests wait for a slot
    let router = match limit {
        Some(limit) => router.layer(GlobalConcurrencyLimitLayer::new(limit)),
        None => router,
    };
    router.layer(TraceLayer::new_for_http())
}

/// Run the HTTP server.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();

    let dispatcher = build_dispatcher(&config)?;
    let state = AppState::new(Arc::new(dispatcher))
        .with_master_key(config.server.master_key.clone())
        .with_concurrency_limit(config.server.max_concurrent_requests);
    if state.master_key.is_none() {
        tracing::warn!("No master key configured - gateway accepts unauthenticated requests");
    }

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(
        address = %listen_addr,
        models = config.models.len(),
        "Starting modelgate server"
    );

    axum::serve(listener, app).await?;

    Ok(())
}
