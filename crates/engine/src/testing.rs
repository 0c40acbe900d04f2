use crate::registry::Session;
use crate::{Engine, EngineConfig};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use zapdesk_core::attachment::AttachmentPolicy;
use zapdesk_core::bus::NotificationBus;
use zapdesk_core::config::PipelineConfig;
use zapdesk_core::protocol::{MessageKey, MessagesUpsert, RawMessage, TransportEvent};
use zapdesk_core::transport::{
    GroupMetadata, LidMappingStore, NumberLookup, OutboundContent, TransportError,
    WhatsAppTransport,
};
use zapdesk_core::types::{Channel, Contact, NewContact, Queue, Tenant, Ticket};
use zapdesk_persistence::{NewChannel, NewQueue, SqliteStore};

/// In-process transport that records everything the engine asks of it.
pub struct MockTransport {
    channel_id: i64,
    counter: AtomicU64,
    sent: Mutex<Vec<(String, OutboundContent)>>,
    lids: Mutex<HashMap<String, String>>,
    media: Mutex<Option<Vec<u8>>>,
    unknown_numbers: Mutex<Vec<String>>,
    rejected: Mutex<Vec<String>>,
    fail_sends: AtomicBool,
}

impl MockTransport {
    pub fn new(channel_id: i64) -> Self {
        Self {
            channel_id,
            counter: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
            lids: Mutex::new(HashMap::new()),
            media: Mutex::new(None),
            unknown_numbers: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        }
    }

    pub fn map_lid(&self, lid: &str, pn: &str) {
        self.lids
            .lock()
            .unwrap()
            .insert(lid.to_string(), pn.to_string());
    }

    pub fn set_media(&self, bytes: Vec<u8>) {
        *self.media.lock().unwrap() = Some(bytes);
    }

    pub fn mark_unknown(&self, number: &str) {
        self.unknown_numbers.lock().unwrap().push(number.to_string());
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, OutboundContent)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, c)| c.preview()).collect()
    }

    pub fn rejected(&self) -> Vec<String> {
        self.rejected.lock().unwrap().clone()
    }
}

#[async_trait]
impl WhatsAppTransport for MockTransport {
    fn channel_id(&self) -> i64 {
        self.channel_id
    }

    async fn send_message(
        &self,
        jid: &str,
        content: &OutboundContent,
    ) -> Result<RawMessage, TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.sent
            .lock()
            .unwrap()
            .push((jid.to_string(), content.clone()));
        Ok(serde_json::from_value(json!({
            "key": {"remoteJid": jid, "fromMe": true, "id": format!("OUT{n}")},
            "message": {"conversation": content.preview()},
            "status": 1
        }))
        .unwrap())
    }

    async fn download_media(&self, _message: &RawMessage) -> Result<Vec<u8>, TransportError> {
        self.media
            .lock()
            .unwrap()
            .clone()
            .ok_or(TransportError::EmptyMedia)
    }

    async fn on_whatsapp(&self, number: &str) -> Result<Vec<NumberLookup>, TransportError> {
        let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
        if self.unknown_numbers.lock().unwrap().contains(&digits) {
            return Ok(vec![]);
        }
        Ok(vec![NumberLookup {
            jid: format!("{digits}@s.whatsapp.net"),
            exists: true,
        }])
    }

    async fn profile_picture_url(&self, _jid: &str) -> Result<String, TransportError> {
        Err(TransportError::Bridge {
            status: 404,
            body: "item-not-found".to_string(),
        })
    }

    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata, TransportError> {
        Ok(GroupMetadata {
            id: jid.to_string(),
            subject: "Grupo de Teste".to_string(),
        })
    }

    async fn read_messages(&self, _keys: &[MessageKey]) -> Result<(), TransportError> {
        Ok(())
    }

    async fn reject_call(&self, call_id: &str, _from: &str) -> Result<(), TransportError> {
        self.rejected.lock().unwrap().push(call_id.to_string());
        Ok(())
    }

    fn lid_mapping(&self) -> Option<&dyn LidMappingStore> {
        Some(self)
    }
}

#[async_trait]
impl LidMappingStore for MockTransport {
    async fn lid_for_pn(&self, pn: &str) -> Result<Option<String>, TransportError> {
        let lids = self.lids.lock().unwrap();
        Ok(lids.iter().find(|(_, p)| p.as_str() == pn).map(|(l, _)| l.clone()))
    }

    async fn pn_for_lid(&self, lid: &str) -> Result<Option<String>, TransportError> {
        Ok(self.lids.lock().unwrap().get(lid).cloned())
    }

    async fn store(&self, lid: &str, pn: &str) -> Result<(), TransportError> {
        self.map_lid(lid, pn);
        Ok(())
    }
}

pub fn text_message(id: &str, jid: &str, text: &str) -> RawMessage {
    serde_json::from_value(json!({
        "key": {"remoteJid": jid, "fromMe": false, "id": id},
        "message": {"conversation": text},
        "pushName": "Maria Souza",
        "status": 2
    }))
    .unwrap()
}

pub const CUSTOMER: &str = "5511999990000@s.whatsapp.net";

/// Long enough for any shortened debounce in the fixture to fire.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
}

pub struct Fixture {
    pub engine: Engine,
    pub session: Arc<Session>,
    pub transport: Arc<MockTransport>,
    pub tenant: Tenant,
    pub channel: Channel,
    _media: TempDir,
}

pub async fn fixture() -> Fixture {
    fixture_with(|_| {}).await
}

pub async fn fixture_with(edit: impl FnOnce(&mut NewChannel)) -> Fixture {
    let store = SqliteStore::in_memory().await.unwrap();
    let tenant = store.create_tenant("Acme", &[]).await.unwrap();
    let mut new_channel = NewChannel {
        tenant_id: tenant.id,
        name: "Principal".to_string(),
        ..Default::default()
    };
    edit(&mut new_channel);
    let channel = store.create_channel(&new_channel).await.unwrap();

    let media = TempDir::new().unwrap();
    let config = EngineConfig {
        attachments: AttachmentPolicy {
            storage_directory: media.path().to_path_buf(),
            ..AttachmentPolicy::default()
        },
        frontend_url: Some("http://crm.local".to_string()),
        pipeline: PipelineConfig {
            out_of_hours_debounce_ms: 20,
            greeting_debounce_ms: 20,
            intent_debounce_ms: 20,
            call_notice_debounce_ms: 20,
            ..PipelineConfig::default()
        },
        ..EngineConfig::default()
    };
    let engine = Engine::new(store, Arc::new(NotificationBus::new(256)), config);
    let transport = Arc::new(MockTransport::new(channel.id));
    let session = engine.sessions.register(tenant.id, transport.clone()).await;

    Fixture {
        engine,
        session,
        transport,
        tenant,
        channel,
        _media: media,
    }
}

impl Fixture {
    pub async fn deliver(&self, raw: RawMessage) {
        let event = TransportEvent::MessagesUpsert(MessagesUpsert {
            messages: vec![raw],
            kind: Some("notify".to_string()),
        });
        self.engine.dispatch(&self.session, event).await;
    }

    pub async fn add_queue(&self, name: &str) -> Queue {
        let queue = self
            .engine
            .store
            .create_queue(&NewQueue {
                tenant_id: self.tenant.id,
                name: name.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        self.engine
            .store
            .attach_queue(self.channel.id, queue.id)
            .await
            .unwrap();
        queue
    }

    pub async fn setting(&self, key: &str, value: &str) {
        self.engine
            .store
            .set_setting(self.tenant.id, key, value)
            .await
            .unwrap();
    }

    pub async fn contact(&self, number: &str) -> Contact {
        self.engine
            .store
            .create_contact(&NewContact {
                tenant_id: self.tenant.id,
                name: "Maria Souza".to_string(),
                number: number.to_string(),
                preferred_id: Some(format!("{number}@s.whatsapp.net")),
                channel_id: Some(self.channel.id),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    pub async fn ticket(&self, contact: &Contact) -> Ticket {
        self.engine
            .store
            .create_ticket(self.tenant.id, contact.id, self.channel.id, false, 0)
            .await
            .unwrap()
    }

    /// Ticket of the fixture customer, reloaded from the store.
    pub async fn customer_ticket(&self) -> Ticket {
        let contact = self
            .engine
            .store
            .find_contact_by_number(self.tenant.id, "5511999990000")
            .await
            .unwrap()
            .unwrap();
        self.engine
            .store
            .find_latest_ticket(self.tenant.id, contact.id, self.channel.id)
            .await
            .unwrap()
            .unwrap()
    }
}
