use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chat message between two users.
///
/// Only `is_read` and `deleted_for_receiver` ever change after creation, and
/// `deleted_for_receiver` only goes from false to true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub sender_id: String,
    pub receiver_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    pub deleted_for_receiver: bool,
}

/// A user directory record. The messaging core reads these to resolve push
/// targets; account events create them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub id: String,
    pub external_id: Option<String>,
    pub username: String,
    pub email: String,
    pub is_verified: bool,
    pub push_token: Option<String>,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
