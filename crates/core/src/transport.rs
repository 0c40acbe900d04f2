use crate::protocol::{MessageKey, RawMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport request failed: {0}")]
    Request(String),
    #[error("Bridge returned {status}: {body}")]
    Bridge { status: u16, body: String },
    #[error("Media not available")]
    EmptyMedia,
    #[error("Transport not connected")]
    NotConnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundButton {
    pub id: String,
    pub display_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRow {
    pub id: String,
    pub title: String,
}

/// What the core asks the transport to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundContent {
    Text {
        text: String,
    },
    Buttons {
        text: String,
        buttons: Vec<OutboundButton>,
    },
    #[serde(rename_all = "camelCase")]
    List {
        text: String,
        button_text: String,
        rows: Vec<OutboundRow>,
    },
    Audio {
        url: String,
        mimetype: String,
        ptt: bool,
    },
    Image {
        url: String,
        caption: Option<String>,
    },
    Reaction {
        text: String,
        key: MessageKey,
    },
}

impl OutboundContent {
    pub fn text(body: impl Into<String>) -> Self {
        OutboundContent::Text { text: body.into() }
    }

    /// Text a ticket should show as its last message after this send.
    pub fn preview(&self) -> String {
        match self {
            OutboundContent::Text { text }
            | OutboundContent::Buttons { text, .. }
            | OutboundContent::List { text, .. } => text.clone(),
            OutboundContent::Audio { .. } => "Áudio".to_string(),
            OutboundContent::Image { caption, .. } => caption.clone().unwrap_or_default(),
            OutboundContent::Reaction { text, .. } => text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberLookup {
    pub jid: String,
    pub exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub id: String,
    pub subject: String,
}

/// Bidirectional lid <-> phone-number mapping kept by the protocol client.
#[async_trait]
pub trait LidMappingStore: Send + Sync {
    async fn lid_for_pn(&self, pn: &str) -> Result<Option<String>, TransportError>;
    async fn pn_for_lid(&self, lid: &str) -> Result<Option<String>, TransportError>;
    async fn store(&self, lid: &str, pn: &str) -> Result<(), TransportError>;
}

/// Capability set of one connected WhatsApp session.
#[async_trait]
pub trait WhatsAppTransport: Send + Sync {
    fn channel_id(&self) -> i64;

    async fn send_message(
        &self,
        jid: &str,
        content: &OutboundContent,
    ) -> Result<RawMessage, TransportError>;

    async fn download_media(&self, message: &RawMessage) -> Result<Vec<u8>, TransportError>;

    async fn on_whatsapp(&self, number: &str) -> Result<Vec<NumberLookup>, TransportError>;

    async fn profile_picture_url(&self, jid: &str) -> Result<String, TransportError>;

    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata, TransportError>;

    async fn read_messages(&self, keys: &[MessageKey]) -> Result<(), TransportError>;

    async fn reject_call(&self, call_id: &str, from: &str) -> Result<(), TransportError>;

    async fn send_presence(&self, _jid: &str, _presence: &str) -> Result<(), TransportError> {
        Ok(())
    }

    /// `None` when the protocol client has no mapping store.
    fn lid_mapping(&self) -> Option<&dyn LidMappingStore>;
}
