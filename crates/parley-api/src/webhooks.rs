//! Inbound account-lifecycle events from the identity provider.
//!
//! The raw body is verified before it is parsed; an event that fails
//! verification never reaches the directory.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use parley_crypto::signature::{HEADER_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use parley_crypto::SignedHeaders;
use parley_db::Database;
use parley_types::api::AccountEvent;

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
struct AccountData {
    id: String,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    email_addresses: Vec<EmailAddress>,
}

#[derive(Debug, Deserialize)]
struct EmailAddress {
    email_address: String,
    #[serde(default)]
    verification: Option<Verification>,
}

#[derive(Debug, Deserialize)]
struct Verification {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionData {
    user_id: String,
}

/// What an accepted event did to the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Applied {
    Created(String),
    AlreadyExists,
    LoginRecorded,
    UnknownAccount,
    Ignored,
}

pub async fn account_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let Some(verifier) = &state.verifier else {
        warn!("Webhook received but no signing secret is configured, rejecting");
        return Err(ApiError::bad_request("Webhook verification is not configured."));
    };

    let signed = SignedHeaders {
        id: header(&headers, HEADER_ID),
        timestamp: header(&headers, HEADER_TIMESTAMP),
        signature: header(&headers, HEADER_SIGNATURE),
    };
    if let Err(e) = verifier.verify(&signed, &body, Utc::now()) {
        warn!("Rejected webhook {}: {}", signed.id.unwrap_or("<no id>"), e);
        return Err(ApiError::bad_request(format!("Webhook verification failed: {e}")));
    }

    let event: AccountEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("Malformed webhook payload: {e}")))?;

    let db = state.db.clone();
    let kind = event.kind.clone();
    let applied = tokio::task::spawn_blocking(move || apply_event(&db, &event, Utc::now()))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::internal()
        })??;

    debug!("Webhook {} applied: {:?}", kind, applied);
    Ok(StatusCode::OK)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn apply_event(db: &Database, event: &AccountEvent, now: DateTime<Utc>) -> Result<Applied, ApiError> {
    match event.kind.as_str() {
        "user.created" => {
            let data: AccountData = parse_data(event)?;
            create_account(db, &data, now)
        }
        "user.signed_in" => {
            let data: AccountData = parse_data(event)?;
            record_login(db, &data.id, now)
        }
        "session.created" => {
            let data: SessionData = parse_data(event)?;
            record_login(db, &data.user_id, now)
        }
        other => {
            debug!("Ignoring account event {}", other);
            Ok(Applied::Ignored)
        }
    }
}

fn parse_data<T: serde::de::DeserializeOwned>(event: &AccountEvent) -> Result<T, ApiError> {
    T::deserialize(&event.data)
        .map_err(|e| ApiError::bad_request(format!("Malformed {} payload: {e}", event.kind)))
}

fn create_account(db: &Database, data: &AccountData, now: DateTime<Utc>) -> Result<Applied, ApiError> {
    let Some(primary) = data.email_addresses.first() else {
        return Err(ApiError::bad_request("Account has no email address."));
    };
    let is_verified = primary
        .verification
        .as_ref()
        .and_then(|v| v.status.as_deref())
        == Some("verified");
    let username = format!(
        "{} {}",
        data.first_name.as_deref().unwrap_or_default(),
        data.last_name.as_deref().unwrap_or_default()
    );

    let created = db
        .create_directory_entry(&data.id, username.trim(), &primary.email_address, is_verified, now)
        .map_err(storage)?;
    match created {
        Some(entry) => {
            info!("Directory entry {} created for account {}", entry.id, data.id);
            Ok(Applied::Created(entry.id))
        }
        None => {
            debug!("Account {} already in directory", data.id);
            Ok(Applied::AlreadyExists)
        }
    }
}

fn record_login(db: &Database, external_id: &str, now: DateTime<Utc>) -> Result<Applied, ApiError> {
    if db.record_login(external_id, now).map_err(storage)? {
        Ok(Applied::LoginRecorded)
    } else {
        debug!("Login for unknown account {}", external_id);
        Ok(Applied::UnknownAccount)
    }
}

fn storage(e: anyhow::Error) -> ApiError {
    error!("Directory update failed: {:#}", e);
    ApiError::internal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use parley_crypto::WebhookVerifier;
    use serde_json::json;
    use std::time::Duration;

    use crate::testing::{call, state};

    const SECRET: &str = "whsec_c2VjcmV0LWtleS1mb3ItdGVzdHM=";

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new(SECRET, Some(Duration::from_secs(300))).unwrap()
    }

    fn created_event() -> serde_json::Value {
        json!({
            "type": "user.created",
            "data": {
                "id": "user_2abc",
                "first_name": "Ada",
                "last_name": "Lovelace",
                "email_addresses": [
                    {"email_address": "ada@example.com", "verification": {"status": "verified"}},
                    {"email_address": "ada@work.example.com", "verification": {"status": "unverified"}}
                ]
            }
        })
    }

    fn signed_request(body: &str, signed_body: &str) -> Request<Body> {
        let id = "msg_1";
        let ts = Utc::now().timestamp().to_string();
        let signature = verifier().sign(id, &ts, signed_body.as_bytes()).unwrap();
        Request::builder()
            .method("POST")
            .uri("/webhooks/accounts")
            .header("content-type", "application/json")
            .header(HEADER_ID, id)
            .header(HEADER_TIMESTAMP, ts)
            .header(HEADER_SIGNATURE, signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn valid_user_created_adds_directory_entry() {
        let state = state(Some(verifier()));
        let body = created_event().to_string();

        let (status, _) = call(&state, signed_request(&body, &body)).await;
        assert_eq!(status, StatusCode::OK);

        let entry = state
            .db
            .get_directory_entry_by_external_id("user_2abc")
            .unwrap()
            .unwrap();
        assert_eq!(entry.username, "Ada Lovelace");
        assert_eq!(entry.email, "ada@example.com");
        assert!(entry.is_verified);
        assert!(entry.last_login.is_none());
    }

    #[tokio::test]
    async fn tampered_body_creates_nothing() {
        let state = state(Some(verifier()));
        let signed = created_event().to_string();
        let tampered = signed.replace("ada@example.com", "eve@example.com");

        let (status, json) = call(&state, signed_request(&tampered, &signed)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["success"], false);
        assert!(state.db.get_directory_entry_by_external_id("user_2abc").unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_headers_are_rejected() {
        let state = state(Some(verifier()));
        let req = Request::builder()
            .method("POST")
            .uri("/webhooks/accounts")
            .body(Body::from(created_event().to_string()))
            .unwrap();
        let (status, _) = call(&state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unconfigured_secret_rejects_everything() {
        let state = state(None);
        let body = created_event().to_string();
        let (status, _) = call(&state, signed_request(&body, &body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(state.db.get_directory_entry_by_external_id("user_2abc").unwrap().is_none());
    }

    #[tokio::test]
    async fn sign_in_records_last_login() {
        let state = state(Some(verifier()));
        let body = created_event().to_string();
        call(&state, signed_request(&body, &body)).await;

        let body = json!({"type": "user.signed_in", "data": {"id": "user_2abc"}}).to_string();
        let (status, _) = call(&state, signed_request(&body, &body)).await;
        assert_eq!(status, StatusCode::OK);

        let entry = state
            .db
            .get_directory_entry_by_external_id("user_2abc")
            .unwrap()
            .unwrap();
        assert!(entry.last_login.is_some());
    }

    #[test]
    fn duplicate_email_does_not_create_second_entry() {
        let db = Database::open_in_memory().unwrap();
        let event: AccountEvent = serde_json::from_value(created_event()).unwrap();
        let now = Utc::now();

        assert!(matches!(apply_event(&db, &event, now).unwrap(), Applied::Created(_)));
        assert_eq!(apply_event(&db, &event, now).unwrap(), Applied::AlreadyExists);
    }

    #[test]
    fn session_events_and_unknown_types() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        let session: AccountEvent =
            serde_json::from_value(json!({"type": "session.created", "data": {"user_id": "user_none"}})).unwrap();
        assert_eq!(apply_event(&db, &session, now).unwrap(), Applied::UnknownAccount);

        let other: AccountEvent =
            serde_json::from_value(json!({"type": "organization.created", "data": {}})).unwrap();
        assert_eq!(apply_event(&db, &other, now).unwrap(), Applied::Ignored);
    }

    #[test]
    fn created_without_email_is_malformed() {
        let db = Database::open_in_memory().unwrap();
        let event: AccountEvent =
            serde_json::from_value(json!({"type": "user.created", "data": {"id": "user_x"}})).unwrap();
        assert!(apply_event(&db, &event, Utc::now()).is_err());
    }
}
