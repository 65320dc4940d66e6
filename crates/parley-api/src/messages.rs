use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use parley_types::api::{
    ConversationQuery, ConversationResponse, DeleteMessageRequest, DeleteMessageResponse, DeleteMode,
    MarkReadResponse, PairRequest, SendMessageRequest, SendMessageResponse, UnreadCountResponse,
};

use crate::AppState;
use crate::error::ApiError;

pub async fn send_message(
    State(state): State<AppState>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let submission = state
        .chat
        .send_message(
            req.sender_id.as_deref().unwrap_or_default(),
            req.receiver_id.as_deref().unwrap_or_default(),
            req.message.as_deref().unwrap_or_default(),
            None,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse {
            success: true,
            chat: submission.into_message(),
        }),
    ))
}

/// The conversation between `senderId` (the viewer) and the path's receiver.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(receiver_id): Path<String>,
    Query(query): Query<ConversationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let viewer = query.sender_id.unwrap_or_default();
    let messages = state.chat.conversation(&viewer, &receiver_id).await?;
    Ok(Json(ConversationResponse {
        success: true,
        messages,
    }))
}

pub async fn mark_as_read(
    State(state): State<AppState>,
    payload: Result<Json<PairRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let updated = state
        .chat
        .mark_as_read(
            req.sender_id.as_deref().unwrap_or_default(),
            req.receiver_id.as_deref().unwrap_or_default(),
        )
        .await?;

    Ok(Json(MarkReadResponse {
        success: true,
        message: "Messages marked as read.".into(),
        updated,
    }))
}

pub async fn unread_messages(
    State(state): State<AppState>,
    Query(query): Query<PairRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let unread_count = state
        .chat
        .unread_count(
            query.sender_id.as_deref().unwrap_or_default(),
            query.receiver_id.as_deref().unwrap_or_default(),
        )
        .await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    payload: Result<Json<DeleteMessageRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    // A malformed id cannot name a stored message
    let message_id = Uuid::parse_str(&message_id).map_err(|_| ApiError::not_found("Message not found."))?;

    let mode = state
        .chat
        .delete_message(message_id, req.user_id.as_deref().unwrap_or_default())
        .await?;

    let message = match mode {
        DeleteMode::BothSides => "Message deleted from both sides.",
        DeleteMode::ReceiverOnly => "Message deleted from your side.",
    };
    Ok(Json(DeleteMessageResponse {
        success: true,
        message: message.into(),
        mode,
    }))
}
