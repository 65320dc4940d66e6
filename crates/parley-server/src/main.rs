use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_api::{AppState, AppStateInner};
use parley_crypto::WebhookVerifier;
use parley_db::Database;
use parley_gateway::connection;
use parley_gateway::dispatcher::Dispatcher;
use parley_gateway::notify::Notifier;
use parley_gateway::registry::ConnectionRegistry;
use parley_gateway::service::ChatService;

mod config;

use config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);

    let verifier = match &config.webhook_secret {
        Some(secret) => Some(
            WebhookVerifier::new(secret, config.webhook_tolerance).context("Invalid PARLEY_WEBHOOK_SECRET")?,
        ),
        None => {
            warn!("PARLEY_WEBHOOK_SECRET is not set; account webhooks will be rejected");
            None
        }
    };
    if !config.push.enabled {
        info!("Push notifications disabled");
    }

    // Shared state
    let dispatcher = Dispatcher::new(ConnectionRegistry::new());
    let notifier = Notifier::new(config.push.clone(), db.clone())?;
    let chat = ChatService::new(db.clone(), dispatcher, notifier);
    let state: AppState = Arc::new(AppStateInner { db, chat, verifier });

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}

fn app(state: AppState) -> Router {
    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state.clone());

    parley_api::router(state)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let chat = state.chat.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, chat))
}
