//! API Routes
//!
//! This module organizes all HTTP endpoints for the application:
//! - `/api/chat` - Chat turns, streamed as SSE or answered as JSON
//! - `/api/default-prompt` - Built-in system prompt
//! - `/api/conversations` - Conversation history and reset
//! - `/api/models/{provider}` - Live model catalogue per provider
//! - `/api/settings` - Saved UI settings
//! - `/api/search` - Direct basic or deep search
//! - `/api/health`, `/api/status` - Health and provider availability
//! - `/` - Minimal chat page

pub mod chat;
pub mod conversations;
pub mod health;
pub mod providers;
pub mod search;
pub mod ui;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::middleware::cors_layer;
use crate::models::AppState;
use crate::settings;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    info!("Creating application router");

    let cors = cors_layer(&state.config.server.cors_allowed_origins);

    let api_router = Router::new()
        .merge(chat::router(state.clone()))
        .merge(conversations::router(state.clone()))
        .merge(providers::router(state.clone()))
        .merge(search::router(state.clone()))
        .merge(settings::router(state.clone()))
        .merge(health::router(state));

    Router::new()
        .merge(api_router)
        .merge(ui::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
