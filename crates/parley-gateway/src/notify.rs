//! Best-effort push notifications through the Expo push API.
//!
//! Every newly stored message triggers one push attempt to the receiver,
//! whether or not they currently have a channel open. Nothing here can fail
//! a send: errors are logged and dropped, and there are no retries.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_types::models::Message;

pub const EXPO_PUSH_URL: &str = "https://exp.host/--/api/v2/push/send";

const NOTIFICATION_TITLE: &str = "New Message";

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub timeout: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: EXPO_PUSH_URL.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// What happened to a single push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Disabled,
    /// The receiver has no push token in the directory.
    NoToken,
    InvalidToken,
    Sent,
    Failed,
}

#[derive(Serialize)]
struct PushNotification<'a> {
    to: &'a str,
    sound: &'static str,
    title: &'static str,
    body: &'a str,
    data: PushRouting<'a>,
}

/// Lets the client open the right conversation when the push is tapped.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PushRouting<'a> {
    sender_id: &'a str,
    message_id: Uuid,
}

#[derive(Deserialize)]
struct PushResponse {
    #[serde(default)]
    data: Vec<PushTicket>,
}

#[derive(Deserialize)]
struct PushTicket {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Clone)]
pub struct Notifier {
    http: reqwest::Client,
    config: PushConfig,
    db: Arc<Database>,
}

impl Notifier {
    pub fn new(config: PushConfig, db: Arc<Database>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build push HTTP client")?;
        Ok(Self { http, config, db })
    }

    /// Fire-and-forget: spawn a push attempt for the message's receiver.
    pub fn notify(&self, message: &Message) {
        if !self.config.enabled {
            return;
        }
        let notifier = self.clone();
        let message = message.clone();
        tokio::spawn(async move {
            let outcome = notifier.deliver(&message).await;
            debug!("Push for message {} to {}: {:?}", message.id, message.receiver_id, outcome);
        });
    }

    /// Look up the receiver's push token and send one notification.
    pub async fn deliver(&self, message: &Message) -> PushOutcome {
        if !self.config.enabled {
            return PushOutcome::Disabled;
        }

        let db = self.db.clone();
        let receiver_id = message.receiver_id.clone();
        let token = match tokio::task::spawn_blocking(move || db.get_push_token(&receiver_id)).await {
            Ok(Ok(token)) => token,
            Ok(Err(e)) => {
                warn!("Push token lookup for {} failed: {}", message.receiver_id, e);
                return PushOutcome::Failed;
            }
            Err(e) => {
                warn!("spawn_blocking join error: {}", e);
                return PushOutcome::Failed;
            }
        };

        let Some(token) = token else {
            debug!("No push token for {}, skipping push", message.receiver_id);
            return PushOutcome::NoToken;
        };

        if !is_push_token(&token) {
            warn!("Invalid push token on file for {}", message.receiver_id);
            return PushOutcome::InvalidToken;
        }

        let payload = [PushNotification {
            to: &token,
            sound: "default",
            title: NOTIFICATION_TITLE,
            body: &message.message,
            data: PushRouting {
                sender_id: &message.sender_id,
                message_id: message.id,
            },
        }];

        let response = match self.http.post(&self.config.endpoint).json(&payload).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Push request for {} failed: {}", message.receiver_id, e);
                return PushOutcome::Failed;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Push service returned {} for {}: {}",
                status,
                message.receiver_id,
                body.chars().take(200).collect::<String>()
            );
            return PushOutcome::Failed;
        }

        // A 200 can still carry per-ticket errors (e.g. DeviceNotRegistered)
        match response.json::<PushResponse>().await {
            Ok(parsed) => {
                if let Some(ticket) = parsed.data.iter().find(|t| t.status == "error") {
                    warn!(
                        "Push ticket error for {}: {}",
                        message.receiver_id,
                        ticket.message.as_deref().unwrap_or("unknown error")
                    );
                    return PushOutcome::Failed;
                }
            }
            Err(e) => debug!("Unreadable push response body: {}", e),
        }

        PushOutcome::Sent
    }
}

/// Accepts `ExponentPushToken[...]` and `ExpoPushToken[...]`.
pub fn is_push_token(token: &str) -> bool {
    ["ExponentPushToken[", "ExpoPushToken["].iter().any(|prefix| {
        token
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(']'))
            .is_some_and(|inner| !inner.is_empty())
    })
}
