use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post, put},
};

use parley_crypto::WebhookVerifier;
use parley_db::Database;
use parley_gateway::service::ChatService;

pub mod error;
pub mod health;
pub mod messages;
pub mod users;
pub mod webhooks;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub chat: ChatService,
    /// `None` when no webhook secret is configured; intake then rejects
    /// every event.
    pub verifier: Option<WebhookVerifier>,
}

/// All HTTP routes except the WebSocket gateway.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/chat/send", post(messages::send_message))
        .route("/chat/messages/{receiver_id}", get(messages::get_messages))
        .route("/chat/mark-as-read", post(messages::mark_as_read))
        .route("/chat/unread-messages", get(messages::unread_messages))
        .route("/chat/delete/{message_id}", delete(messages::delete_message))
        .route("/users/{user_id}/push-token", put(users::set_push_token))
        .route("/webhooks/accounts", post(webhooks::account_event))
        .with_state(state)
}
