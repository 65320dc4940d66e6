use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use tracing::{error, info};

use parley_types::api::PushTokenRequest;

use crate::AppState;
use crate::error::ApiError;

/// Store the device push token for a directory entry.
pub async fn set_push_token(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    payload: Result<Json<PushTokenRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(req) = payload?;
    let token = req.push_token.trim().to_string();
    if token.is_empty() {
        return Err(ApiError::bad_request("pushToken is required."));
    }

    let db = state.db.clone();
    let uid = user_id.clone();
    let updated = tokio::task::spawn_blocking(move || db.set_push_token(&uid, &token))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::internal()
        })?
        .map_err(|e| {
            error!("Failed to store push token for {}: {:#}", user_id, e);
            ApiError::internal()
        })?;

    if !updated {
        return Err(ApiError::not_found("User not found."));
    }
    info!("Push token updated for {}", user_id);
    Ok(StatusCode::NO_CONTENT)
}
