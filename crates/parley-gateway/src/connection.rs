use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_types::events::{GatewayCommand, GatewayEvent};

use crate::registry::{Connection, ConnectionId, ConnectionRegistry};
use crate::service::{ChatError, ChatService};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Per-channel state: which user (if any) this channel is registered under,
/// and the queue feeding its writer task.
pub struct Session {
    conn_id: ConnectionId,
    tx: mpsc::UnboundedSender<GatewayEvent>,
    registry: ConnectionRegistry,
    service: ChatService,
    registration: Mutex<Registration>,
}

/// Once `closed` is set, the channel can never be registered again.
#[derive(Default)]
struct Registration {
    current: Option<Connection>,
    closed: bool,
}

impl Session {
    pub fn new(service: ChatService, tx: mpsc::UnboundedSender<GatewayEvent>) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            tx,
            registry: service.dispatcher().registry().clone(),
            service,
            registration: Mutex::new(Registration::default()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn registered_user(&self) -> Option<String> {
        self.lock_registration().current.as_ref().map(|c| c.user_id.clone())
    }

    pub async fn handle_command(&self, cmd: GatewayCommand) {
        match cmd {
            GatewayCommand::RegisterUser { user_id } => self.register(&user_id),

            GatewayCommand::SendMessage {
                sender_id,
                receiver_id,
                message,
                ack_id,
            } => {
                let event = self.send(&sender_id, &receiver_id, &message, ack_id).await;
                self.reply(event);
            }
        }
    }

    fn register(&self, user_id: &str) {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            self.reply(GatewayEvent::Error {
                message: "userId is required.".into(),
            });
            return;
        }

        {
            let mut registration = self.lock_registration();
            if registration.closed {
                debug!("Channel {} closed before registering {}", self.conn_id, user_id);
                return;
            }
            if let Some(previous) = registration.current.take() {
                self.registry.unregister(&previous);
            }
            registration.current = Some(self.registry.register(user_id, self.conn_id, self.tx.clone()));
        }

        info!("Channel {} registered for {}", self.conn_id, user_id);
        self.reply(GatewayEvent::Registered {
            user_id: user_id.to_string(),
        });
    }

    async fn send(
        &self,
        sender_id: &str,
        receiver_id: &str,
        body: &str,
        ack_id: Option<String>,
    ) -> GatewayEvent {
        if let Some(registered) = self.registered_user() {
            if registered != sender_id.trim() {
                warn!(
                    "Channel {} registered as {} tried to send as {}",
                    self.conn_id, registered, sender_id
                );
                return send_failure(ack_id, "senderId does not match the registered user.".into());
            }
        }

        match self
            .service
            .send_message(sender_id, receiver_id, body, Some(self.conn_id))
            .await
        {
            Ok(submission) => GatewayEvent::SendResult {
                ack_id,
                success: true,
                message: Some(submission.into_message()),
                error: None,
            },
            Err(ChatError::Storage(_)) => send_failure(ack_id, "Internal Server Error".into()),
            Err(e) => send_failure(ack_id, e.to_string()),
        }
    }

    fn reply(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }

    /// Drop this channel's registry entry, if any. Later registrations on
    /// this session are ignored.
    pub fn close(&self) {
        let mut registration = self.lock_registration();
        registration.closed = true;
        if let Some(conn) = registration.current.take() {
            self.registry.unregister(&conn);
        }
    }

    fn lock_registration(&self) -> MutexGuard<'_, Registration> {
        self.registration.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn send_failure(ack_id: Option<String>, error: String) -> GatewayEvent {
    GatewayEvent::SendResult {
        ack_id,
        success: false,
        message: None,
        error: Some(error),
    }
}

/// Drive one WebSocket until either side goes away. The channel's registry
/// entry is removed as soon as the loop ends; in-flight sends and pushes
/// are left to finish on their own.
pub async fn handle_connection(socket: WebSocket, service: ChatService) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<GatewayEvent>();
    let session = Arc::new(Session::new(service, tx));
    let conn_id = session.id();

    info!("Channel {} connected to gateway", conn_id);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward queued events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode gateway event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let recv_session = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => recv_session.handle_command(cmd).await,
                    Err(e) => {
                        warn!(
                            "Channel {} bad command: {} -- raw: {}",
                            conn_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        recv_session.reply(GatewayEvent::Error {
                            message: format!("Unrecognized command: {e}"),
                        });
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let user = session.registered_user();
    session.close();
    match user {
        Some(user_id) => info!("Channel {} ({}) disconnected from gateway", conn_id, user_id),
        None => debug!("Unregistered channel {} disconnected", conn_id),
    }
}
