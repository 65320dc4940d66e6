use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use parley_db::{Database, Removal, Submission};
use parley_types::api::DeleteMode;
use parley_types::models::Message;

use crate::dispatcher::Dispatcher;
use crate::notify::Notifier;
use crate::registry::ConnectionId;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(&'static str),

    #[error("You are not authorized to delete this message.")]
    Unauthorized,

    #[error("Message not found.")]
    NotFound,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

type PairKey = (String, String);

/// The messaging pipeline shared by the WebSocket gateway and the HTTP API:
/// store (with dedup), fan out to open channels, then push.
#[derive(Clone)]
pub struct ChatService {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    notifier: Notifier,
    /// Serializes submit+deliver per conversation so fan-out order matches
    /// storage order.
    pair_locks: Arc<DashMap<PairKey, Arc<Mutex<()>>>>,
}

impl ChatService {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher, notifier: Notifier) -> Self {
        Self {
            db,
            dispatcher,
            notifier,
            pair_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Store a message and hand it to the dispatcher and the push gateway.
    ///
    /// Success means the message is persisted; delivery and push happen
    /// regardless of whether anyone is online. A duplicate inside the dedup
    /// window returns the first message and is not re-delivered.
    ///
    /// The pipeline runs as its own task: dropping the returned future (a
    /// closed channel, an aborted reader) does not stop fan-out of a message
    /// that gets stored.
    pub async fn send_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        body: &str,
        origin: Option<ConnectionId>,
    ) -> Result<Submission, ChatError> {
        let sender_id = required(sender_id, "senderId is required.")?.to_string();
        let receiver_id = required(receiver_id, "receiverId is required.")?.to_string();
        if body.trim().is_empty() {
            return Err(ChatError::Validation("message is required."));
        }
        let body = body.to_string();

        let service = self.clone();
        tokio::spawn(async move { service.submit_and_fan_out(sender_id, receiver_id, body, origin).await })
            .await
            .map_err(|e| {
                error!("send pipeline join error: {}", e);
                ChatError::Storage(anyhow!("send pipeline failed: {}", e))
            })?
    }

    async fn submit_and_fan_out(
        &self,
        sender_id: String,
        receiver_id: String,
        body: String,
        origin: Option<ConnectionId>,
    ) -> Result<Submission, ChatError> {
        let key = pair_key(&sender_id, &receiver_id);
        let lock = self.pair_locks.entry(key.clone()).or_default().clone();

        let result = {
            let _guard = lock.lock().await;

            let (s, r) = (sender_id.clone(), receiver_id.clone());
            let submission = self
                .blocking(move |db| db.submit_message(&s, &r, &body, Utc::now()))
                .await;

            if let Ok(Submission::Created(message)) = &submission {
                self.dispatcher.deliver(message, origin);
                self.notifier.notify(message);
            }
            submission
        };

        drop(lock);
        self.pair_locks.remove_if(&key, |_, l| Arc::strong_count(l) == 1);

        match &result {
            Ok(Submission::Created(m)) => info!("Message {} stored ({} -> {})", m.id, m.sender_id, m.receiver_id),
            Ok(Submission::Duplicate(m)) => debug!("Duplicate send resolved to message {}", m.id),
            Err(e) => error!("Failed to store message {} -> {}: {}", sender_id, receiver_id, e),
        }
        result
    }

    pub async fn conversation(&self, viewer: &str, peer: &str) -> Result<Vec<Message>, ChatError> {
        let viewer = required(viewer, "Sender ID is required.")?.to_string();
        let peer = required(peer, "Receiver ID is required.")?.to_string();
        self.blocking(move |db| db.get_conversation(&viewer, &peer)).await
    }

    pub async fn mark_as_read(&self, sender_id: &str, receiver_id: &str) -> Result<usize, ChatError> {
        let (s, r) = pair_args(sender_id, receiver_id)?;
        self.blocking(move |db| db.mark_as_read(&s, &r)).await
    }

    pub async fn unread_count(&self, sender_id: &str, receiver_id: &str) -> Result<u64, ChatError> {
        let (s, r) = pair_args(sender_id, receiver_id)?;
        self.blocking(move |db| db.unread_count(&s, &r)).await
    }

    /// Sender deletes for both sides; receiver hides it for themselves;
    /// anyone else is refused.
    pub async fn delete_message(&self, message_id: Uuid, requester: &str) -> Result<DeleteMode, ChatError> {
        let requester = required(requester, "userId is required.")?;

        let message = self
            .blocking(move |db| db.get_message(&message_id))
            .await?
            .ok_or(ChatError::NotFound)?;

        if message.sender_id == requester {
            self.hard_delete(message_id, requester).await?;
            Ok(DeleteMode::BothSides)
        } else if message.receiver_id == requester {
            self.soft_delete_for_receiver(message_id, requester).await?;
            Ok(DeleteMode::ReceiverOnly)
        } else {
            Err(ChatError::Unauthorized)
        }
    }

    pub async fn hard_delete(&self, message_id: Uuid, requester: &str) -> Result<(), ChatError> {
        let who = requester.to_string();
        let removal = self.blocking(move |db| db.hard_delete_message(&message_id, &who)).await?;
        removal_result(removal)?;
        info!("Message {} deleted by sender {}", message_id, requester);
        Ok(())
    }

    pub async fn soft_delete_for_receiver(&self, message_id: Uuid, requester: &str) -> Result<(), ChatError> {
        let who = requester.to_string();
        let removal = self
            .blocking(move |db| db.soft_delete_for_receiver(&message_id, &who))
            .await?;
        removal_result(removal)?;
        info!("Message {} hidden for receiver {}", message_id, requester);
        Ok(())
    }

    /// Run a DB call off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T, ChatError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                ChatError::Storage(anyhow!("background task failed: {}", e))
            })?
            .map_err(ChatError::from)
    }
}

fn required<'a>(value: &'a str, message: &'static str) -> Result<&'a str, ChatError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ChatError::Validation(message));
    }
    Ok(value)
}

fn pair_args(sender_id: &str, receiver_id: &str) -> Result<(String, String), ChatError> {
    const MISSING: &str = "Receiver and Sender IDs are required.";
    Ok((
        required(sender_id, MISSING)?.to_string(),
        required(receiver_id, MISSING)?.to_string(),
    ))
}

fn pair_key(a: &str, b: &str) -> PairKey {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

fn removal_result(removal: Removal) -> Result<(), ChatError> {
    match removal {
        Removal::Removed => Ok(()),
        Removal::NotFound => Err(ChatError::NotFound),
        Removal::NotPermitted => Err(ChatError::Unauthorized),
    }
}
