// Research Chat - streaming LLM research assistant with web-search tools

pub mod agents;
pub mod config;
pub mod conversation;
pub mod db;
pub mod events;
pub mod llm;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod settings;
pub mod tools;
pub mod types;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use models::AppState;

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}
