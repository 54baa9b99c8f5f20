//! Settings API Routes
//!
//! - GET /api/settings - Saved UI settings, or the configured defaults
//! - POST /api/settings - Partial update

use axum::{extract::State, routing::get, Json, Router};
use tracing::info;

use super::{UiSettings, UpdateSettingsRequest};
use crate::models::AppState;
use crate::types::AppResult;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/settings", get(get_settings).post(update_settings))
        .with_state(state)
}

async fn get_settings(State(state): State<AppState>) -> Json<UiSettings> {
    Json(state.settings.load().await)
}

async fn update_settings(
    State(state): State<AppState>,
    Json(request): Json<UpdateSettingsRequest>,
) -> AppResult<Json<UiSettings>> {
    let mut settings = state.settings.load().await;
    settings.apply(request);
    state.settings.save(&settings).await?;
    info!(provider = %settings.provider, deep_research = settings.deep_research, "Settings updated");
    Ok(Json(settings))
}
