use axum::{extract::State, routing::get, Json, Router};

use crate::models::{AppState, HealthResponse, ProviderInfo, StatusResponse};
use crate::types::LLMProvider;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/status", get(status))
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = match state.storage.health_check().await {
        Ok(()) => "connected".to_string(),
        Err(e) => format!("error: {}", e),
    };

    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        database,
    })
}

/// Which providers and search tools have keys configured
async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let llm = &state.config.llm;
    let search = &state.config.search;

    let providers = LLMProvider::ALL
        .iter()
        .map(|provider| ProviderInfo {
            name: provider.to_string(),
            available: llm.api_key(*provider).is_some(),
            default_model: if *provider == llm.default_provider {
                llm.model_for(*provider)
            } else {
                provider.default_model().to_string()
            },
            models: provider.suggested_models().iter().map(|m| m.to_string()).collect(),
        })
        .collect();

    Json(StatusResponse {
        status: "ok".to_string(),
        providers,
        tavily_available: search.has_tavily(),
        serpapi_available: search.has_serpapi(),
        search_available: search.has_tavily() || search.has_serpapi(),
    })
}
