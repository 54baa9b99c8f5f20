use axum::{extract::State, routing::post, Json, Router};
use serde::Serialize;
use tracing::{info, warn};
use validator::Validate;

use crate::agents::TurnConfig;
use crate::events::ProgressEmitter;
use crate::models::{AppState, SearchRequest, SearchResponse, SearchType};
use crate::tools::deep_search::DeepSearchOptions;
use crate::tools::{search_backend, DeepSearchTool};
use crate::types::{AppError, AppResult};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/search", post(search))
        .with_state(state)
}

/// Search without a conversation. Upstream failures are reported in the body.
async fn search(State(state): State<AppState>, Json(request): Json<SearchRequest>) -> AppResult<Json<SearchResponse>> {
    request
        .validate()
        .map_err(|e| AppError::InvalidRequest(e.to_string()))?;
    info!(search_type = ?request.search_type, query_len = request.query.len(), "Direct search");

    let outcome = match request.search_type {
        SearchType::Basic => basic_search(&state, &request).await,
        SearchType::Deep => deep_search(&state, &request).await,
    };

    Ok(Json(match outcome {
        Ok(data) => SearchResponse {
            success: true,
            data: Some(data),
            error: None,
        },
        Err(e) => {
            warn!(error = %e, "Direct search failed");
            SearchResponse {
                success: false,
                data: None,
                error: Some(e.to_string()),
            }
        }
    }))
}

fn to_value<T: Serialize>(value: &T) -> AppResult<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

async fn basic_search(state: &AppState, request: &SearchRequest) -> AppResult<serde_json::Value> {
    let backend = search_backend(&state.config.search)
        .ok_or_else(|| AppError::Config("No search API key configured".to_string()))?;
    let response = backend.search(&request.query, request.max_results).await?;
    to_value(&response)
}

async fn deep_search(state: &AppState, request: &SearchRequest) -> AppResult<serde_json::Value> {
    let backend = search_backend(&state.config.search)
        .ok_or_else(|| AppError::Config("No search API key configured".to_string()))?;
    let llm = state.llm_for(&TurnConfig::from_config(&state.config))?;
    let options = DeepSearchOptions {
        num_sub_queries: 3,
        max_results_per_query: request.max_results,
        ..DeepSearchOptions::default()
    };
    let report = DeepSearchTool::new(backend, llm, ProgressEmitter::noop())
        .research(&request.query, &options)
        .await?;
    to_value(&report)
}
