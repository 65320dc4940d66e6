/// Row types that map directly to SQLite rows.
/// Distinct from parley-types API models to keep the DB layer independent.
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use parley_types::models::{DirectoryEntry, Message};

pub struct MessageRow {
    pub seq: i64,
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: String,
    pub created_at: i64,
    pub is_read: bool,
    pub deleted_for_receiver: bool,
}

pub struct UserRow {
    pub id: String,
    pub external_id: Option<String>,
    pub username: String,
    pub email: String,
    pub is_verified: bool,
    pub push_token: Option<String>,
    pub last_login: Option<i64>,
    pub created_at: i64,
}

pub(crate) fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

impl MessageRow {
    pub fn into_message(self) -> Result<Message> {
        let id = self
            .id
            .parse()
            .map_err(|e| anyhow!("corrupt message id '{}': {}", self.id, e))?;

        Ok(Message {
            id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            message: self.body,
            timestamp: millis_to_utc(self.created_at)?,
            is_read: self.is_read,
            deleted_for_receiver: self.deleted_for_receiver,
        })
    }
}

impl UserRow {
    pub fn into_entry(self) -> Result<DirectoryEntry> {
        Ok(DirectoryEntry {
            id: self.id,
            external_id: self.external_id,
            username: self.username,
            email: self.email,
            is_verified: self.is_verified,
            push_token: self.push_token,
            last_login: self.last_login.map(millis_to_utc).transpose()?,
            created_at: millis_to_utc(self.created_at)?,
        })
    }
}
