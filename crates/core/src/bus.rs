use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

pub const ROOM_NOTIFICATION: &str = "notification";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notification {
    /// Target rooms; empty means every subscriber.
    pub rooms: Vec<String>,
    pub event: String,
    pub payload: Value,
}

impl Notification {
    pub fn reaches(&self, joined: &[String]) -> bool {
        self.rooms.is_empty() || self.rooms.iter().any(|r| joined.contains(r))
    }
}

pub fn ticket_event(tenant_id: i64) -> String {
    format!("tenant-{tenant_id}-ticket")
}

pub fn message_event(tenant_id: i64) -> String {
    format!("tenant-{tenant_id}-appMessage")
}

pub fn contact_event(tenant_id: i64) -> String {
    format!("tenant-{tenant_id}-contact")
}

/// Room-scoped fan-out to connected agent UIs.
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Publish to the given rooms. Having no listeners is not an error.
    pub fn emit_to_rooms<I, S>(&self, rooms: I, event: &str, payload: Value) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let notification = Notification {
            rooms: rooms.into_iter().map(Into::into).collect(),
            event: event.to_string(),
            payload,
        };
        self.tx.send(notification).unwrap_or(0)
    }

    pub fn emit_to_room(&self, room: &str, event: &str, payload: Value) -> usize {
        self.emit_to_rooms([room], event, payload)
    }

    pub fn broadcast(&self, event: &str, payload: Value) -> usize {
        self.emit_to_rooms(Vec::<String>::new(), event, payload)
    }
}
