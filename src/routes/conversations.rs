use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::info;
use validator::Validate;

use crate::db::{Conversation, TurnStatus};
use crate::models::{AppState, ConversationDetail, ListConversationsQuery, UpdateConversationRequest};
use crate::types::{AppError, AppResult};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/conversations", get(list_conversations))
        .route(
            "/api/conversations/{id}",
            get(get_conversation)
                .patch(update_conversation)
                .delete(delete_conversation),
        )
        .route("/api/conversations/{id}/reset", post(reset_conversation))
        .with_state(state)
}

async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<ListConversationsQuery>,
) -> AppResult<Json<Vec<Conversation>>> {
    let limit = query.limit.clamp(1, 200);
    let offset = query.offset.max(0);
    Ok(Json(state.storage.list_conversations(limit, offset).await?))
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<ConversationDetail>> {
    let conversation = state
        .storage
        .get_conversation(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Conversation {}", id)))?;
    let messages = state.storage.get_messages(&id, None).await?;
    Ok(Json(ConversationDetail { conversation, messages }))
}

async fn update_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateConversationRequest>,
) -> AppResult<Json<Conversation>> {
    request
        .validate()
        .map_err(|e| AppError::InvalidRequest(e.to_string()))?;
    let title = request.title.as_deref().map(str::trim);
    let conversation = state
        .storage
        .update_conversation(&id, title, request.metadata)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Conversation {}", id)))?;
    info!(conversation_id = %id, "Conversation updated");
    Ok(Json(conversation))
}

async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<(StatusCode, Json<Value>)> {
    if !state.storage.delete_conversation(&id).await? {
        return Err(AppError::NotFound(format!("Conversation {}", id)));
    }
    info!(conversation_id = %id, "Conversation deleted");
    Ok((StatusCode::OK, Json(json!({ "status": "deleted", "conversation_id": id }))))
}

/// Clear the history but keep the conversation and its title
async fn reset_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    if state.storage.get_conversation(&id).await?.is_none() {
        return Err(AppError::NotFound(format!("Conversation {}", id)));
    }
    let deleted = state.storage.delete_messages(&id).await?;
    state.storage.set_turn_status(&id, TurnStatus::Idle).await?;
    info!(conversation_id = %id, deleted, "Conversation reset");
    Ok(Json(json!({ "status": "reset", "conversation_id": id, "deleted_messages": deleted })))
}
