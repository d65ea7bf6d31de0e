use axum::{
    Json,
    extract::{
        Multipart, Query, State,
        multipart::MultipartRejection,
        rejection::JsonRejection,
    },
};
use serde::Deserialize;
use tracing::debug;

use crate::AppState;
use crate::error::{ChatError, ChatResult};
use crate::models::MessageDraft;

use super::parse_id;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMessagesParams {
    conversation_id: Option<String>,
}

/// `GET /api/messages?conversationId=` - full history, oldest first.
pub async fn list_messages(
    State(state): State<AppState>,
    Query(params): Query<ListMessagesParams>,
) -> ChatResult<Json<serde_json::Value>> {
    let conversation_id = parse_id(params.conversation_id.as_deref(), "conversationId")?;
    let messages = state.repository.list_messages(conversation_id).await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "messages": messages,
    })))
}

/// `POST /api/messages` - multipart form with text fields. File parts are
/// ignored; the upload itself happens upstream and arrives here as `fileUrl`.
pub async fn create_message(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ChatResult<Json<serde_json::Value>> {
    let mut multipart = multipart.map_err(|e| ChatError::invalid(e.body_text()))?;
    let draft = read_draft(&mut multipart).await?;

    let view = state.ingress.submit(&draft).await?;
    let conversation_id = view.message.conversation_id;

    Ok(Json(serde_json::json!({
        "success": true,
        "message": view,
        "conversationId": conversation_id,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    conversation_id: Option<i64>,
    user_id: Option<i64>,
}

/// `PUT /api/messages` - mark every message addressed to `userId` as read.
pub async fn mark_messages_read(
    State(state): State<AppState>,
    body: Result<Json<MarkReadRequest>, JsonRejection>,
) -> ChatResult<Json<serde_json::Value>> {
    let Json(req) = body.map_err(|e| ChatError::invalid(e.body_text()))?;
    let conversation_id = req
        .conversation_id
        .ok_or_else(|| ChatError::invalid("conversationId is required"))?;
    let user_id = req
        .user_id
        .ok_or_else(|| ChatError::invalid("userId is required"))?;

    let count = state
        .ingress
        .mark_read(conversation_id, user_id, None)
        .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "count": count,
    })))
}

async fn read_draft(multipart: &mut Multipart) -> ChatResult<MessageDraft> {
    let mut draft = MessageDraft::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ChatError::invalid(e.body_text()))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if field.file_name().is_some() {
            debug!(field = %name, "Skipping file part");
            continue;
        }
        let value = field
            .text()
            .await
            .map_err(|e| ChatError::invalid(e.body_text()))?;
        let value = value.trim();
        if value.is_empty() {
            continue;
        }

        match name.as_str() {
            "conversationId" => draft.conversation_id = Some(parse_number(value, &name)?),
            "senderId" => draft.sender_id = Some(parse_number(value, &name)?),
            "receiverId" => draft.receiver_id = Some(parse_number(value, &name)?),
            "content" => draft.content = Some(value.to_string()),
            "type" => draft.message_type = Some(value.to_string()),
            "fileUrl" => draft.file_url = Some(value.to_string()),
            "fileName" => draft.file_name = Some(value.to_string()),
            "fileSize" => draft.file_size = Some(parse_number(value, &name)?),
            "fileType" => draft.file_type = Some(value.to_string()),
            _ => debug!(field = %name, "Ignoring unknown form field"),
        }
    }

    Ok(draft)
}

fn parse_number(value: &str, field: &str) -> ChatResult<i64> {
    value
        .parse()
        .map_err(|_| ChatError::invalid(format!("{} must be an integer", field)))
}
