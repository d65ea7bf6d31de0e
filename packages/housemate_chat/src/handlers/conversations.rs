use axum::{
    Json,
    extract::{Query, State, rejection::JsonRejection},
};
use serde::Deserialize;

use crate::AppState;
use crate::error::{ChatError, ChatResult};

use super::parse_id;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListConversationsParams {
    user_id: Option<String>,
}

/// `GET /api/conversations?userId=` - the user's conversations, most recent first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Query(params): Query<ListConversationsParams>,
) -> ChatResult<Json<serde_json::Value>> {
    let user_id = parse_id(params.user_id.as_deref(), "userId")?;
    let conversations = state.repository.list_conversations(user_id).await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "conversations": conversations,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenConversationRequest {
    user_id: Option<i64>,
    other_user_id: Option<i64>,
}

/// `POST /api/conversations` - the pair's conversation, created on first use.
/// Either participant may ask; both get the same conversation.
pub async fn open_conversation(
    State(state): State<AppState>,
    body: Result<Json<OpenConversationRequest>, JsonRejection>,
) -> ChatResult<Json<serde_json::Value>> {
    let Json(req) = body.map_err(|e| ChatError::invalid(e.body_text()))?;
    let user_id = req
        .user_id
        .ok_or_else(|| ChatError::invalid("userId is required"))?;
    let other_user_id = req
        .other_user_id
        .ok_or_else(|| ChatError::invalid("otherUserId is required"))?;

    let conversation = state
        .repository
        .get_or_create_conversation(user_id, other_user_id)
        .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "conversation": conversation,
    })))
}
