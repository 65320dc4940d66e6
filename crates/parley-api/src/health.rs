use axum::{Json, extract::State};

use parley_types::api::HealthResponse;

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.chat.dispatcher().registry().connection_count(),
    })
}
