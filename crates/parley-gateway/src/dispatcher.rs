use std::collections::HashSet;

use tracing::trace;

use parley_types::events::GatewayEvent;
use parley_types::models::Message;

use crate::registry::{ConnectionId, ConnectionRegistry};

/// Fans persisted messages out to the open channels of the two participants.
///
/// Only the receiver's channels and the sender's other devices get the
/// event; nothing is broadcast to unrelated connections.
#[derive(Clone)]
pub struct Dispatcher {
    registry: ConnectionRegistry,
}

impl Dispatcher {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Deliver `message` as a `newMessage` event, at most once per open
    /// channel. `origin` is the channel the send came from; it already gets
    /// a `sendResult` and is always skipped.
    ///
    /// Returns how many channels accepted the event. Zero is not an error.
    pub fn deliver(&self, message: &Message, origin: Option<ConnectionId>) -> usize {
        let event = GatewayEvent::NewMessage {
            message: message.clone(),
        };
        let mut seen: HashSet<ConnectionId> = HashSet::new();
        let mut delivered = 0;

        let receivers = self.registry.channels_for(&message.receiver_id);
        let senders = self.registry.channels_for(&message.sender_id);
        for conn in receivers.iter().chain(senders.iter()) {
            if Some(conn.id) == origin {
                continue;
            }
            if seen.insert(conn.id) && conn.send(event.clone()) {
                delivered += 1;
            }
        }

        trace!(
            "Message {} ({} -> {}) delivered to {} channel(s)",
            message.id, message.sender_id, message.receiver_id, delivered
        );
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn message(from: &str, to: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            sender_id: from.into(),
            receiver_id: to.into(),
            message: "hello".into(),
            timestamp: Utc::now(),
            is_read: false,
            deleted_for_receiver: false,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<GatewayEvent>) -> Vec<GatewayEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn targets_receiver_and_senders_other_devices_only() {
        let registry = ConnectionRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone());

        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        let (alice_phone_tx, mut alice_phone_rx) = mpsc::unbounded_channel();
        let (alice_laptop_tx, mut alice_laptop_rx) = mpsc::unbounded_channel();
        let (carol_tx, mut carol_rx) = mpsc::unbounded_channel();

        registry.register("bob", Uuid::new_v4(), bob_tx);
        let phone = registry.register("alice", Uuid::new_v4(), alice_phone_tx);
        registry.register("alice", Uuid::new_v4(), alice_laptop_tx);
        registry.register("carol", Uuid::new_v4(), carol_tx);

        let msg = message("alice", "bob");
        assert_eq!(dispatcher.deliver(&msg, Some(phone.id)), 2);

        let bob_events = drain(&mut bob_rx);
        assert_eq!(bob_events.len(), 1);
        match &bob_events[0] {
            GatewayEvent::NewMessage { message } => assert_eq!(message.id, msg.id),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(drain(&mut alice_laptop_rx).len(), 1);
        assert!(drain(&mut alice_phone_rx).is_empty());
        assert!(drain(&mut carol_rx).is_empty());
    }

    #[test]
    fn nobody_online_is_not_an_error() {
        let dispatcher = Dispatcher::new(ConnectionRegistry::new());
        assert_eq!(dispatcher.deliver(&message("alice", "bob"), None), 0);
    }

    #[test]
    fn self_addressed_message_reaches_each_channel_once() {
        let registry = ConnectionRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("alice", Uuid::new_v4(), tx);

        assert_eq!(dispatcher.deliver(&message("alice", "alice"), None), 1);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn self_addressed_message_skips_origin() {
        let registry = ConnectionRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone());
        let (phone_tx, mut phone_rx) = mpsc::unbounded_channel();
        let (laptop_tx, mut laptop_rx) = mpsc::unbounded_channel();
        let phone = registry.register("alice", Uuid::new_v4(), phone_tx);
        registry.register("alice", Uuid::new_v4(), laptop_tx);

        assert_eq!(dispatcher.deliver(&message("alice", "alice"), Some(phone.id)), 1);
        assert!(drain(&mut phone_rx).is_empty());
        assert_eq!(drain(&mut laptop_rx).len(), 1);
    }
}
