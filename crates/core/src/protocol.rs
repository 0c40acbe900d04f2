//! Wire shapes produced by the WhatsApp Web bridge.
//!
//! Only the fields the pipeline reads are typed. Anything else a payload
//! carries lands in [`MessagePayload::other`] so unknown message shapes can be
//! reported instead of silently disappearing.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const STATUS_BROADCAST: &str = "status@broadcast";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    #[serde(default)]
    pub remote_jid: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub key: MessageKey,
    #[serde(default)]
    pub message: Option<MessagePayload>,
    #[serde(default, deserialize_with = "de_timestamp")]
    pub message_timestamp: Option<i64>,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub participant: Option<String>,
    #[serde(default)]
    pub status: Option<i64>,
    /// Protocol stub type name ("REVOKE", "CIPHERTEXT", ...).
    #[serde(default)]
    pub message_stub_type: Option<String>,
}

impl RawMessage {
    pub fn remote_jid(&self) -> &str {
        self.key.remote_jid.as_deref().unwrap_or_default()
    }

    pub fn external_id(&self) -> &str {
        self.key.id.as_deref().unwrap_or_default()
    }

    pub fn is_group(&self) -> bool {
        self.remote_jid().ends_with("@g.us")
    }

    /// Sender inside a group, falling back to the chat itself.
    pub fn sender_jid(&self) -> &str {
        self.participant
            .as_deref()
            .or(self.key.participant.as_deref())
            .unwrap_or_else(|| self.remote_jid())
    }
}

/// Timestamps arrive as numbers, numeric strings or `{low, high}` longs.
fn de_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse().ok(),
        Some(Value::Object(o)) => {
            let low = o.get("low").and_then(Value::as_i64).unwrap_or_default();
            let high = o.get("high").and_then(Value::as_i64).unwrap_or_default();
            Some((high << 32) | (low & 0xffff_ffff))
        }
        _ => None,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    #[serde(default)]
    pub stanza_id: Option<String>,
    #[serde(default)]
    pub participant: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedText {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub context_info: Option<ContextInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMessage {
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub ptt: Option<bool>,
    #[serde(default)]
    pub context_info: Option<ContextInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMessage {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub context_info: Option<ContextInfo>,
}

/// Envelope used by view-once, ephemeral, edited and captioned-document messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FutureProof {
    #[serde(default)]
    pub message: Option<Box<MessagePayload>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    #[serde(default)]
    pub key: Option<MessageKey>,
    #[serde(default, rename = "type")]
    pub kind: Option<Value>,
    #[serde(default)]
    pub edited_message: Option<Box<MessagePayload>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonsResponse {
    #[serde(default)]
    pub selected_button_id: Option<String>,
    #[serde(default)]
    pub selected_display_text: Option<String>,
    #[serde(default)]
    pub context_info: Option<ContextInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateButtonReply {
    #[serde(default)]
    pub selected_id: Option<String>,
    #[serde(default)]
    pub selected_display_text: Option<String>,
    #[serde(default)]
    pub context_info: Option<ContextInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleSelectReply {
    #[serde(default)]
    pub selected_row_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub single_select_reply: Option<SingleSelectReply>,
    #[serde(default)]
    pub context_info: Option<ContextInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonText {
    #[serde(default)]
    pub display_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Button {
    #[serde(default)]
    pub button_id: Option<String>,
    #[serde(default)]
    pub button_text: Option<ButtonText>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonsMessage {
    #[serde(default)]
    pub content_text: Option<String>,
    #[serde(default)]
    pub buttons: Vec<Button>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRow {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub row_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSection {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub rows: Vec<ListRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMessage {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sections: Vec<ListSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactMessage {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub vcard: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactsArrayMessage {
    #[serde(default)]
    pub contacts: Vec<ContactMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationMessage {
    #[serde(default)]
    pub degrees_latitude: Option<f64>,
    #[serde(default)]
    pub degrees_longitude: Option<f64>,
    #[serde(default)]
    pub jpeg_thumbnail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionMessage {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub key: Option<MessageKey>,
}

/// Content of a protocol message. At most one variant field is normally set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_text_message: Option<ExtendedText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_message: Option<FutureProof>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_message: Option<ProtocolMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_message: Option<MediaMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_message: Option<MediaMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_message: Option<MediaMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticker_message: Option<MediaMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_message: Option<DocumentMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_with_caption_message: Option<FutureProof>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buttons_response_message: Option<ButtonsResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_button_reply_message: Option<TemplateButtonReply>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_response_message: Option<ListResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buttons_message: Option<ButtonsMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_message: Option<ListMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_once_message: Option<FutureProof>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_message: Option<FutureProof>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_message: Option<ContactMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contacts_array_message: Option<ContactsArrayMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_message: Option<LocationMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_location_message: Option<LocationMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction_message: Option<ReactionMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_context_info: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_key_distribution_message: Option<Value>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesUpsert {
    pub messages: Vec<RawMessage>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageUpdateFields {
    #[serde(default)]
    pub status: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub key: MessageKey,
    #[serde(default)]
    pub update: MessageUpdateFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LidMapping {
    pub lid: String,
    pub pn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOffer {
    pub id: String,
    pub from: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Event classes the bridge pushes for one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum TransportEvent {
    #[serde(rename = "messages.upsert")]
    MessagesUpsert(MessagesUpsert),
    #[serde(rename = "messages.update")]
    MessagesUpdate(Vec<MessageUpdate>),
    #[serde(rename = "lid-mapping.update")]
    LidMappingUpdate(LidMapping),
    #[serde(rename = "call")]
    Call(Vec<CallOffer>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_upsert_event_parses_known_and_unknown_fields() {
        let event: TransportEvent = serde_json::from_value(json!({
            "event": "messages.upsert",
            "data": {
                "type": "notify",
                "messages": [{
                    "key": {"remoteJid": "5511999999999@s.whatsapp.net", "fromMe": false, "id": "ABC"},
                    "message": {"conversation": "oi", "pollCreationMessage": {"name": "x"}},
                    "messageTimestamp": "1700000000",
                    "pushName": "Maria"
                }]
            }
        }))
        .unwrap();

        let TransportEvent::MessagesUpsert(upsert) = event else {
            panic!("wrong variant");
        };
        let msg = &upsert.messages[0];
        assert_eq!(msg.external_id(), "ABC");
        assert_eq!(msg.message_timestamp, Some(1_700_000_000));
        let payload = msg.message.as_ref().unwrap();
        assert_eq!(payload.conversation.as_deref(), Some("oi"));
        assert!(payload.other.contains_key("pollCreationMessage"));
    }

    #[test]
    fn test_long_timestamp_object() {
        let msg: RawMessage = serde_json::from_value(json!({
            "key": {"id": "1"},
            "messageTimestamp": {"low": 1700000000, "high": 0, "unsigned": true}
        }))
        .unwrap();
        assert_eq!(msg.message_timestamp, Some(1_700_000_000));
    }

    #[test]
    fn test_sender_prefers_participant() {
        let msg: RawMessage = serde_json::from_value(json!({
            "key": {"remoteJid": "123-456@g.us", "participant": "5511@s.whatsapp.net", "id": "1"}
        }))
        .unwrap();
        assert!(msg.is_group());
        assert_eq!(msg.sender_jid(), "5511@s.whatsapp.net");
    }
}
