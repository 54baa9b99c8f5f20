use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use tracing::{info, warn};

use crate::models::{AppState, ModelsResponse};
use crate::types::{AppError, AppResult, LLMProvider};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/models/{provider}", get(list_models))
        .with_state(state)
}

/// Live model catalogue of one provider. Provider failures are reported in the body.
async fn list_models(State(state): State<AppState>, Path(provider): Path<String>) -> AppResult<Json<ModelsResponse>> {
    let provider = LLMProvider::from_id(&provider)
        .ok_or_else(|| AppError::InvalidRequest(format!("Unknown provider: {}", provider)))?;

    let failed = |error: String| ModelsResponse {
        provider: provider.to_string(),
        models: Vec::new(),
        error: Some(error),
    };

    if state.config.llm.api_key(provider).is_none() {
        return Ok(Json(failed("API key not configured".to_string())));
    }

    let outcome = match state.llm_for_provider(provider) {
        Ok(llm) => llm.list_models().await,
        Err(e) => Err(e),
    };
    Ok(Json(match outcome {
        Ok(models) => {
            info!(provider = %provider, count = models.len(), "Listed provider models");
            ModelsResponse {
                provider: provider.to_string(),
                models,
                error: None,
            }
        }
        Err(e) => {
            warn!(provider = %provider, error = %e, "Model listing failed");
            failed(e.to_string())
        }
    }))
}
