use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};
use validator::Validate;

use crate::agents::{ResearchPipeline, TurnConfig, SEARCH_SYSTEM_PROMPT};
use crate::config::Config;
use crate::conversation::ConversationService;
use crate::events::ProgressEmitter;
use crate::models::{AppState, ChatRequest, ChatResponse};
use crate::settings::UiSettings;
use crate::tools::ToolRegistry;
use crate::types::{AppError, AppResult, LLMProvider};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(post_chat))
        .route("/api/default-prompt", get(default_prompt))
        .with_state(state)
}

/// Request fields win over saved settings, saved settings over configuration
pub fn resolve_turn_config(config: &Config, settings: &UiSettings, request: &ChatRequest) -> AppResult<TurnConfig> {
    let mut turn = TurnConfig::from_config(config);

    turn.provider = match request.provider.as_deref() {
        Some(id) => LLMProvider::from_id(id)
            .ok_or_else(|| AppError::InvalidRequest(format!("Unknown provider: {}", id)))?,
        None => settings.provider,
    };

    let requested_model = request.model.as_deref().map(str::trim).filter(|m| !m.is_empty());
    turn.model = match requested_model {
        Some(model) => Some(model.to_string()),
        // A saved model belongs to the saved provider
        None if turn.provider == settings.provider => settings.model().map(String::from).or(turn.model),
        None if turn.provider == config.llm.default_provider => turn.model,
        None => None,
    };

    turn.system_prompt = request
        .system_prompt
        .clone()
        .or_else(|| settings.system_prompt.clone())
        .filter(|p| !p.trim().is_empty());
    turn.planner_system_prompt = request
        .planner_system_prompt
        .clone()
        .filter(|p| !p.trim().is_empty());
    turn.deep_research = request.deep_research.unwrap_or(settings.deep_research);
    turn.multi_agent = request.multi_agent.unwrap_or(settings.multi_agent);
    turn.stream = request.stream;

    if let Some(tz) = request.timezone.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        if tz.parse::<chrono_tz::Tz>().is_ok() {
            turn.timezone = tz.to_string();
        } else {
            warn!(timezone = %tz, "Unknown timezone, using default");
        }
    }

    Ok(turn)
}

pub async fn post_chat(State(state): State<AppState>, Json(request): Json<ChatRequest>) -> AppResult<Response> {
    request
        .validate()
        .map_err(|e| AppError::InvalidRequest(e.to_string()))?;
    if request.message.trim().is_empty() {
        return Err(AppError::InvalidRequest("message must not be blank".to_string()));
    }

    let settings = state.settings.load().await;
    let turn = resolve_turn_config(&state.config, &settings, &request)?;
    let llm = state.llm_for(&turn)?;

    info!(
        provider = %turn.provider,
        model = %llm.model(),
        deep_research = turn.deep_research,
        multi_agent = turn.multi_agent,
        stream = turn.stream,
        "Received chat request"
    );

    let (emitter, rx) = ProgressEmitter::channel();
    let tools = ToolRegistry::for_turn(&state.config.search, &llm, turn.deep_research, &turn.timezone, &emitter);
    let stream = turn.stream;
    let pipeline = ResearchPipeline::new(llm, tools, turn, &emitter);
    let service = ConversationService::new(state.storage.clone(), state.config.agent.history_limit);
    let handle = service.spawn(request.conversation_id, request.message, pipeline, emitter);

    if stream {
        // The turn keeps running if the browser goes away
        let events = UnboundedReceiverStream::new(rx).map(|event| Event::default().json_data(&event));
        return Ok(Sse::new(events).keep_alive(KeepAlive::default()).into_response());
    }

    drop(rx);
    let reply = handle
        .await
        .map_err(|e| AppError::Internal(format!("Turn task failed: {}", e)))??;
    Ok(Json(ChatResponse {
        response: reply.content,
        conversation_id: reply.conversation_id,
    })
    .into_response())
}

async fn default_prompt() -> Json<Value> {
    Json(json!({ "prompt": SEARCH_SYSTEM_PROMPT }))
}
