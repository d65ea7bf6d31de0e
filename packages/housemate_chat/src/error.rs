//! Error taxonomy for the messaging subsystem.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Missing or malformed required field. Raised before any store access.
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    /// The supplied conversation does not contain the supplied participants.
    #[error("{0}")]
    Conflict(String),

    /// The real-time channel for a connection is unavailable. Only ever logged.
    #[error("delivery to connection {conn_id} failed: {reason}")]
    TransientDeliveryFailure { conn_id: String, reason: String },

    #[error("store failure: {0}")]
    InternalStoreFailure(#[from] sqlx::Error),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ChatError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ChatError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ChatError::Conflict(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatError::InvalidArgument(_) | ChatError::Conflict(_) => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::TransientDeliveryFailure { .. } | ChatError::InternalStoreFailure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to show a client. Store failures are reported generically.
    pub fn public_message(&self) -> String {
        match self {
            ChatError::InternalStoreFailure(_) | ChatError::TransientDeliveryFailure { .. } => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self);
        }
        (
            status,
            Json(serde_json::json!({
                "success": false,
                "message": self.public_message(),
            })),
        )
            .into_response()
    }
}
