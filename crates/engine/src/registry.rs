use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::info;
use zapdesk_core::protocol::TransportEvent;
use zapdesk_core::transport::WhatsAppTransport;

const EVENT_CAPACITY: usize = 256;

/// One connected WhatsApp channel: its transport and its event stream.
pub struct Session {
    pub channel_id: i64,
    pub tenant_id: i64,
    pub transport: Arc<dyn WhatsAppTransport>,
    events: broadcast::Sender<TransportEvent>,
}

impl Session {
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Hand an event to the listener. Returns how many listeners saw it.
    pub fn publish(&self, event: TransportEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<i64, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the transport under its channel id, replacing any previous session.
    pub async fn register(&self, tenant_id: i64, transport: Arc<dyn WhatsAppTransport>) -> Arc<Session> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let session = Arc::new(Session {
            channel_id: transport.channel_id(),
            tenant_id,
            transport,
            events,
        });
        info!(channel_id = session.channel_id, tenant_id, "Session registered");
        self.sessions
            .write()
            .await
            .insert(session.channel_id, session.clone());
        session
    }

    pub async fn deregister(&self, channel_id: i64) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(&channel_id);
        if removed.is_some() {
            info!(channel_id, "Session removed");
        }
        removed
    }

    pub async fn get(&self, channel_id: i64) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&channel_id).cloned()
    }

    pub async fn channel_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.sessions.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
