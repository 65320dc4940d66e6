use crate::Database;
use crate::models::{MessageRow, UserRow};
use anyhow::Result;
use chrono::{DateTime, Utc};
use parley_types::models::{DirectoryEntry, Message};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::debug;
use uuid::Uuid;

/// Identical (sender, receiver, body) submissions closer together than this
/// resolve to the first stored message.
pub const DEDUP_WINDOW_MS: i64 = 5_000;

const MESSAGE_COLUMNS: &str =
    "seq, id, sender_id, receiver_id, body, created_at, is_read, deleted_for_receiver";

const USER_COLUMNS: &str =
    "id, external_id, username, email, is_verified, push_token, last_login, created_at";

/// Result of submitting a message to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Created(Message),
    /// An identical message was stored inside the dedup window.
    Duplicate(Message),
}

impl Submission {
    pub fn message(&self) -> &Message {
        match self {
            Self::Created(m) | Self::Duplicate(m) => m,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Self::Created(m) | Self::Duplicate(m) => m,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Outcome of a participant-scoped delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    NotFound,
    /// The requester does not hold the role this delete requires.
    NotPermitted,
}

impl Database {
    // -- Messages --

    /// Persist a message unless an identical one was stored within the dedup
    /// window. The lookup and the insert share one immediate transaction.
    pub fn submit_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Submission> {
        let now_ms = now.timestamp_millis();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages
                         WHERE sender_id = ?1 AND receiver_id = ?2 AND body = ?3
                           AND created_at >= ?4
                         ORDER BY created_at DESC, seq DESC
                         LIMIT 1"
                    ),
                    params![sender_id, receiver_id, body, now_ms - DEDUP_WINDOW_MS],
                    message_row,
                )
                .optional()?;

            if let Some(row) = existing {
                tx.commit()?;
                debug!("Duplicate submission {} -> {} resolved to {}", sender_id, receiver_id, row.id);
                return Ok(Submission::Duplicate(row.into_message()?));
            }

            // Keep the conversation's timestamps non-decreasing even if the
            // caller's clock steps backwards.
            let latest: Option<i64> = tx.query_row(
                "SELECT MAX(created_at) FROM messages
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)",
                params![sender_id, receiver_id],
                |r| r.get(0),
            )?;
            let created_at = latest.map_or(now_ms, |l| l.max(now_ms));

            let id = Uuid::new_v4();
            tx.execute(
                "INSERT INTO messages (id, sender_id, receiver_id, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), sender_id, receiver_id, body, created_at],
            )?;
            tx.commit()?;

            Ok(Submission::Created(Message {
                id,
                sender_id: sender_id.to_string(),
                receiver_id: receiver_id.to_string(),
                message: body.to_string(),
                timestamp: crate::models::millis_to_utc(created_at)?,
                is_read: false,
                deleted_for_receiver: false,
            }))
        })
    }

    pub fn get_message(&self, id: &Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| query_message(conn, id))?
            .map(MessageRow::into_message)
            .transpose()
    }

    /// Both directions of a conversation in creation order, as seen by
    /// `viewer`: messages the viewer soft-deleted as receiver are left out.
    pub fn get_conversation(&self, viewer: &str, peer: &str) -> Result<Vec<Message>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE ((sender_id = ?1 AND receiver_id = ?2)
                     OR (sender_id = ?2 AND receiver_id = ?1))
                   AND NOT (receiver_id = ?1 AND sender_id != ?1 AND deleted_for_receiver = 1)
                 ORDER BY created_at ASC, seq ASC"
            ))?;

            let rows = stmt
                .query_map(params![viewer, peer], message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(MessageRow::into_message).collect()
    }

    /// Flip every unread message from `sender_id` to `receiver_id`.
    /// Returns how many rows changed.
    pub fn mark_as_read(&self, sender_id: &str, receiver_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE sender_id = ?1 AND receiver_id = ?2 AND is_read = 0",
                params![sender_id, receiver_id],
            )?;
            Ok(updated)
        })
    }

    pub fn unread_count(&self, sender_id: &str, receiver_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE sender_id = ?1 AND receiver_id = ?2
                   AND is_read = 0 AND deleted_for_receiver = 0",
                params![sender_id, receiver_id],
                |r| r.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
    }

    /// Remove a message for both parties. Only its sender may do this.
    pub fn hard_delete_message(&self, id: &Uuid, requester: &str) -> Result<Removal> {
        self.with_conn(|conn| {
            let Some(row) = query_message(conn, id)? else {
                return Ok(Removal::NotFound);
            };
            if row.sender_id != requester {
                return Ok(Removal::NotPermitted);
            }
            conn.execute("DELETE FROM messages WHERE id = ?1", [id.to_string()])?;
            Ok(Removal::Removed)
        })
    }

    /// Hide a message from its receiver. Only the receiver may do this, and
    /// the flag never goes back to false.
    pub fn soft_delete_for_receiver(&self, id: &Uuid, requester: &str) -> Result<Removal> {
        self.with_conn(|conn| {
            let Some(row) = query_message(conn, id)? else {
                return Ok(Removal::NotFound);
            };
            if row.receiver_id != requester {
                return Ok(Removal::NotPermitted);
            }
            conn.execute(
                "UPDATE messages SET deleted_for_receiver = 1 WHERE id = ?1",
                [id.to_string()],
            )?;
            Ok(Removal::Removed)
        })
    }

    // -- Directory --

    pub fn get_directory_entry(&self, id: &str) -> Result<Option<DirectoryEntry>> {
        self.with_conn(|conn| query_user(conn, "id", id))?
            .map(UserRow::into_entry)
            .transpose()
    }

    pub fn get_directory_entry_by_external_id(&self, external_id: &str) -> Result<Option<DirectoryEntry>> {
        self.with_conn(|conn| query_user(conn, "external_id", external_id))?
            .map(UserRow::into_entry)
            .transpose()
    }

    pub fn get_push_token(&self, user_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let token: Option<Option<String>> = conn
                .query_row("SELECT push_token FROM users WHERE id = ?1", [user_id], |r| r.get(0))
                .optional()?;
            Ok(token.flatten().filter(|t| !t.is_empty()))
        })
    }

    /// Returns false when no entry has this id.
    pub fn set_push_token(&self, user_id: &str, token: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE users SET push_token = ?2 WHERE id = ?1",
                params![user_id, token],
            )?;
            Ok(updated > 0)
        })
    }

    /// Create an entry for an upstream account. Returns `None` when an entry
    /// with the same email or external id already exists.
    pub fn create_directory_entry(
        &self,
        external_id: &str,
        username: &str,
        email: &str,
        is_verified: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<DirectoryEntry>> {
        let id = Uuid::new_v4().to_string();
        let inserted = self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO users (id, external_id, username, email, is_verified, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, external_id, username, email, is_verified, now.timestamp_millis()],
            )?;
            Ok(inserted)
        })?;

        if inserted == 0 {
            return Ok(None);
        }
        self.get_directory_entry(&id)
    }

    /// Returns false when no entry carries this external id.
    pub fn record_login(&self, external_id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE users SET last_login = ?2 WHERE external_id = ?1",
                params![external_id, now.timestamp_millis()],
            )?;
            Ok(updated > 0)
        })
    }
}

fn message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        seq: row.get(0)?,
        id: row.get(1)?,
        sender_id: row.get(2)?,
        receiver_id: row.get(3)?,
        body: row.get(4)?,
        created_at: row.get(5)?,
        is_read: row.get(6)?,
        deleted_for_receiver: row.get(7)?,
    })
}

fn user_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        external_id: row.get(1)?,
        username: row.get(2)?,
        email: row.get(3)?,
        is_verified: row.get(4)?,
        push_token: row.get(5)?,
        last_login: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn query_message(conn: &Connection, id: &Uuid) -> Result<Option<MessageRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            [id.to_string()],
            message_row,
        )
        .optional()?;
    Ok(row)
}

/// `column` is always one of our own identifiers, never user input.
fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = ?1"),
            [value],
            user_row,
        )
        .optional()?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn resubmission_inside_window_returns_same_message() {
        let db = db();
        let first = db.submit_message("a", "b", "hello", t0()).unwrap();
        let second = db
            .submit_message("a", "b", "hello", t0() + Duration::seconds(2))
            .unwrap();

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(first.message().id, second.message().id);
        assert_eq!(db.get_conversation("a", "b").unwrap().len(), 1);
        assert_eq!(db.unread_count("a", "b").unwrap(), 1);
    }

    #[test]
    fn resubmission_after_window_creates_new_message() {
        let db = db();
        let first = db.submit_message("a", "b", "hello", t0()).unwrap();
        let second = db
            .submit_message("a", "b", "hello", t0() + Duration::seconds(6))
            .unwrap();

        assert!(!second.is_duplicate());
        assert_ne!(first.message().id, second.message().id);
        assert_eq!(db.unread_count("a", "b").unwrap(), 2);
    }

    #[test]
    fn dedup_key_includes_direction_and_body() {
        let db = db();
        let now = t0();
        let a = db.submit_message("a", "b", "hello", now).unwrap();
        let b = db.submit_message("b", "a", "hello", now).unwrap();
        let c = db.submit_message("a", "b", "hello!", now).unwrap();

        assert!(!b.is_duplicate());
        assert!(!c.is_duplicate());
        assert_ne!(a.message().id, b.message().id);
        assert_ne!(a.message().id, c.message().id);
    }

    #[test]
    fn conversation_is_in_creation_order() {
        let db = db();
        let mut ids = Vec::new();
        for (i, (from, to)) in [("a", "b"), ("b", "a"), ("a", "b"), ("a", "b")].iter().enumerate() {
            let sub = db.submit_message(from, to, &format!("msg {i}"), t0()).unwrap();
            ids.push(sub.message().id);
        }

        let from_a: Vec<Uuid> = db.get_conversation("a", "b").unwrap().iter().map(|m| m.id).collect();
        let from_b: Vec<Uuid> = db.get_conversation("b", "a").unwrap().iter().map(|m| m.id).collect();
        assert_eq!(from_a, ids);
        assert_eq!(from_b, ids);
    }

    #[test]
    fn timestamps_never_go_backwards_within_a_pair() {
        let db = db();
        let first = db.submit_message("a", "b", "one", t0()).unwrap();
        let second = db
            .submit_message("b", "a", "two", t0() - Duration::seconds(30))
            .unwrap();

        assert!(second.message().timestamp >= first.message().timestamp);
        let bodies: Vec<String> = db
            .get_conversation("a", "b")
            .unwrap()
            .into_iter()
            .map(|m| m.message)
            .collect();
        assert_eq!(bodies, vec!["one", "two"]);
    }

    #[test]
    fn hard_delete_by_sender_removes_for_both() {
        let db = db();
        let id = db.submit_message("a", "b", "oops", t0()).unwrap().message().id;

        assert_eq!(db.hard_delete_message(&id, "a").unwrap(), Removal::Removed);
        assert!(db.get_message(&id).unwrap().is_none());
        assert!(db.get_conversation("a", "b").unwrap().is_empty());
        assert!(db.get_conversation("b", "a").unwrap().is_empty());
        assert_eq!(db.hard_delete_message(&id, "a").unwrap(), Removal::NotFound);
    }

    #[test]
    fn soft_delete_hides_message_from_receiver_only() {
        let db = db();
        let id = db.submit_message("a", "b", "secret", t0()).unwrap().message().id;

        assert_eq!(db.soft_delete_for_receiver(&id, "b").unwrap(), Removal::Removed);
        assert_eq!(db.get_conversation("a", "b").unwrap().len(), 1);
        assert!(db.get_conversation("b", "a").unwrap().is_empty());
        assert_eq!(db.unread_count("a", "b").unwrap(), 0);

        let stored = db.get_message(&id).unwrap().unwrap();
        assert!(stored.deleted_for_receiver);
    }

    #[test]
    fn deletes_check_participant_role() {
        let db = db();
        let id = db.submit_message("a", "b", "mine", t0()).unwrap().message().id;

        assert_eq!(db.hard_delete_message(&id, "b").unwrap(), Removal::NotPermitted);
        assert_eq!(db.hard_delete_message(&id, "c").unwrap(), Removal::NotPermitted);
        assert_eq!(db.soft_delete_for_receiver(&id, "a").unwrap(), Removal::NotPermitted);
        assert_eq!(db.soft_delete_for_receiver(&id, "c").unwrap(), Removal::NotPermitted);

        let stored = db.get_message(&id).unwrap().unwrap();
        assert!(!stored.deleted_for_receiver);
    }

    #[test]
    fn mark_as_read_flips_one_direction() {
        let db = db();
        db.submit_message("a", "b", "1", t0()).unwrap();
        db.submit_message("a", "b", "2", t0()).unwrap();
        db.submit_message("b", "a", "3", t0()).unwrap();

        assert_eq!(db.mark_as_read("a", "b").unwrap(), 2);
        assert_eq!(db.unread_count("a", "b").unwrap(), 0);
        assert_eq!(db.unread_count("b", "a").unwrap(), 1);
        assert_eq!(db.mark_as_read("a", "b").unwrap(), 0);
    }

    #[test]
    fn directory_entries_and_push_tokens() {
        let db = db();
        let entry = db
            .create_directory_entry("user_ext_1", "Ada Lovelace", "ada@example.com", true, t0())
            .unwrap()
            .unwrap();
        assert_eq!(entry.external_id.as_deref(), Some("user_ext_1"));
        assert!(db.get_push_token(&entry.id).unwrap().is_none());

        assert!(db.set_push_token(&entry.id, "ExponentPushToken[abc]").unwrap());
        assert_eq!(
            db.get_push_token(&entry.id).unwrap().as_deref(),
            Some("ExponentPushToken[abc]")
        );
        assert!(!db.set_push_token("missing", "ExponentPushToken[abc]").unwrap());

        // Same email again is ignored
        assert!(db
            .create_directory_entry("user_ext_2", "Other", "ada@example.com", false, t0())
            .unwrap()
            .is_none());

        assert!(db.record_login("user_ext_1", t0()).unwrap());
        assert!(!db.record_login("nobody", t0()).unwrap());
        let entry = db.get_directory_entry_by_external_id("user_ext_1").unwrap().unwrap();
        assert_eq!(entry.last_login, Some(t0()));
    }
}
