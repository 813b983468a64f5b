//! Tollbooth backend binary: wires the three network-facing listeners (T2
//! proxy channel, T3 UI channel, T4 REST facade) onto one shared `AppState`
//! and runs them concurrently, mirroring the teacher's "load config, build
//! collaborators, serve" `main.rs` shape.

mod llm_client;
mod proxy_channel;
mod rest;
mod state;
mod ui_channel;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tollbooth_common::configuration::Configuration;
use tollbooth_core::events::EventBus;
use tollbooth_core::facade::Facade;
use tollbooth_core::intercept::InterceptManager;
use tollbooth_core::llm::{Classifier, LLMClient, LlmCache, RegexFallbackClassifier};
use tollbooth_core::persistence::FilePersistence;
use tollbooth_core::storage::Storage;
use tollbooth_parsers::ParserRegistry;

use llm_client::ReqwestLlmClient;
use state::AppState;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn build_state(config: Configuration) -> AppState {
    let storage = Arc::new(Storage::new());
    let persistence = Arc::new(FilePersistence::new(config.data_root.clone(), config.persistence.clone()));

    for flow in persistence.load_flows().await {
        storage.insert_flow(flow).await;
    }
    for rule in persistence.load_rules().await {
        storage.insert_rule(rule).await;
    }
    storage.replace_conversations(persistence.load_conversations().await).await;
    storage.replace_refusal_rules(persistence.load_refusal_rules().await).await;
    for item in persistence.load_stored_requests().await {
        storage.put_stored_item(item).await;
    }
    for item in persistence.load_stored_responses().await {
        storage.put_stored_item(item).await;
    }
    for pending in persistence.load_pending_refusals().await {
        storage.insert_pending_refusal(pending).await;
    }
    storage.seed_short_ids().await;

    let intercept = Arc::new(InterceptManager::new(storage.clone(), config.modify_llm_failure_enters_queue));
    let events = Arc::new(EventBus::new());
    let llm_cache = Arc::new(LlmCache::new());
    let facade = Arc::new(Facade::new(storage.clone(), intercept.clone(), events.clone(), llm_cache.clone()));

    let llm_client: Option<Arc<dyn LLMClient>> = if config.provider_base_urls.is_empty() && config.provider_api_keys.is_empty() {
        None
    } else {
        Some(Arc::new(ReqwestLlmClient::new(config.provider_base_urls.clone(), config.provider_api_keys.clone())))
    };
    let classifier: Arc<dyn Classifier> = Arc::new(RegexFallbackClassifier::with_default_patterns());

    let active_provider = config.provider_base_urls.keys().next().cloned().unwrap_or_else(|| "openai".to_string());

    AppState {
        storage,
        intercept,
        events,
        facade,
        persistence,
        llm_cache,
        llm_client,
        classifier,
        parsers: Arc::new(ParserRegistry::new()),
        config: Arc::new(config),
        templates: Arc::new(Mutex::new(HashMap::new())),
        active_provider: Arc::new(Mutex::new(active_provider)),
        proxy_outbox: Arc::new(Mutex::new(None)),
    }
}

/// Periodically clears timed-out pending intercepts (spec.md §4.2, §5) and
/// pushes the resulting verdicts to the connected proxy session, if any.
fn spawn_intercept_sweep(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(tollbooth_core::intercept::SWEEP_INTERVAL_MS as u64));
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now().timestamp_millis();
            let verdicts = state.intercept.sweep_timeouts(now).await;
            if verdicts.is_empty() {
                continue;
            }
            let Some(tx) = state.proxy_outbox.lock().await.clone() else { continue };
            for verdict in verdicts {
                tracing::info!(flow_id = %verdict.flow_id(), "pending intercept timed out, auto-forwarding");
                let _ = tx.send(proxy_channel::verdict_to_outbound(&state, verdict).await);
            }
        }
    });
}

/// Periodically auto-approves `PendingRefusal`s that have sat unresolved
/// past the 5-minute timeout (spec.md §4.7 "prompt_user ... 5-minute
/// auto-approve timeout").
fn spawn_refusal_sweep(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(tollbooth_core::intercept::SWEEP_INTERVAL_MS as u64));
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now().timestamp_millis();
            let expired = state.storage.sweep_expired_refusals(now, tollbooth_core::intercept::PENDING_TIMEOUT_MS).await;
            for mut pending in expired {
                tracing::info!(id = %pending.id, "pending refusal timed out, auto-approving");
                pending.status = tollbooth_core::model::RefusalStatus::Approved;
                state.persistence.delete_pending_refusal(&pending.id).await;
                state.events.publish(tollbooth_core::events::UiEvent::RefusalResolved { id: pending.id.clone(), status: pending.status });
                if let Some(tx) = state.proxy_outbox.lock().await.clone() {
                    let _ = tx.send(proxy_channel::Outbound::ForwardResponse { flow_id: pending.flow_id.clone() });
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config = Configuration::load(None);
    tracing::info!(
        proxy = %config.proxy_channel_address,
        ui = %config.ui_channel_address,
        rest = %config.rest_channel_address,
        persistence = config.persistence_enabled(),
        "starting tollbooth-backend"
    );

    let state = build_state(config).await;

    spawn_intercept_sweep(state.clone());
    spawn_refusal_sweep(state.clone());

    let proxy_router = axum::Router::new().route("/", axum::routing::get(proxy_channel::proxy_ws_handler)).with_state(state.clone());
    let ui_router = axum::Router::new().route("/", axum::routing::get(ui_channel::ui_ws_handler)).with_state(state.clone());
    let rest_router = rest::router(state.clone()).layer(tower_http::cors::CorsLayer::permissive());

    let proxy_listener = tokio::net::TcpListener::bind(&state.config.proxy_channel_address).await?;
    let ui_listener = tokio::net::TcpListener::bind(&state.config.ui_channel_address).await?;
    let rest_listener = tokio::net::TcpListener::bind(&state.config.rest_channel_address).await?;

    tracing::info!("listening: proxy={} ui={} rest={}", proxy_listener.local_addr()?, ui_listener.local_addr()?, rest_listener.local_addr()?);

    tokio::try_join!(
        async { axum::serve(proxy_listener, proxy_router).await },
        async { axum::serve(ui_listener, ui_router).await },
        async { axum::serve(rest_listener, rest_router).await },
    )?;

    Ok(())
}
