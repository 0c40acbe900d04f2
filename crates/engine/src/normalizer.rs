//! Classification of raw WhatsApp payloads into a kind plus display body.

use regex::Regex;
use std::sync::LazyLock;
use zapdesk_core::protocol::{ContextInfo, MessagePayload, RawMessage, STATUS_BROADCAST};

static NUMERIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-?[0-9]+$").unwrap());

const IGNORED_STUBS: &[&str] = &[
    "REVOKE",
    "E2E_DEVICE_CHANGED",
    "E2E_IDENTITY_CHANGED",
    "CIPHERTEXT",
];

/// Payload keys that ride along with real content and never describe it.
const ENVELOPE_KEYS: &[&str] = &["messageContextInfo", "senderKeyDistributionMessage"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Conversation,
    ExtendedText,
    Edited,
    Image,
    Video,
    Audio,
    Sticker,
    Document,
    DocumentWithCaption,
    ButtonsResponse,
    TemplateButtonReply,
    ListResponse,
    Buttons,
    List,
    Contact,
    ContactsArray,
    Location,
    LiveLocation,
    Reaction,
    /// Payload shape the classifier does not know; `shape` lists its keys.
    Unknown { shape: String },
}

impl MessageKind {
    /// Name stored as the message's media type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Conversation => "conversation",
            MessageKind::ExtendedText => "extendedTextMessage",
            MessageKind::Edited => "editedMessage",
            MessageKind::Image => "imageMessage",
            MessageKind::Video => "videoMessage",
            MessageKind::Audio => "audioMessage",
            MessageKind::Sticker => "stickerMessage",
            MessageKind::Document => "documentMessage",
            MessageKind::DocumentWithCaption => "documentWithCaptionMessage",
            MessageKind::ButtonsResponse => "buttonsResponseMessage",
            MessageKind::TemplateButtonReply => "templateButtonReplyMessage",
            MessageKind::ListResponse => "listResponseMessage",
            MessageKind::Buttons => "buttonsMessage",
            MessageKind::List => "listMessage",
            MessageKind::Contact => "contactMessage",
            MessageKind::ContactsArray => "contactsArrayMessage",
            MessageKind::Location => "locationMessage",
            MessageKind::LiveLocation => "liveLocationMessage",
            MessageKind::Reaction => "reactionMessage",
            MessageKind::Unknown { .. } => "unknown",
        }
    }

    pub fn has_media(&self) -> bool {
        matches!(
            self,
            MessageKind::Image
                | MessageKind::Video
                | MessageKind::Audio
                | MessageKind::Sticker
                | MessageKind::Document
                | MessageKind::DocumentWithCaption
        )
    }

    /// Kinds a human can type from the phone itself.
    pub fn is_typed_text(&self) -> bool {
        matches!(
            self,
            MessageKind::Conversation | MessageKind::ExtendedText | MessageKind::Contact
        )
    }
}

/// Whether an upserted message should enter the pipeline at all.
pub fn is_processable(raw: &RawMessage) -> bool {
    if raw.remote_jid() == STATUS_BROADCAST {
        return false;
    }
    if raw
        .message_stub_type
        .as_deref()
        .is_some_and(|stub| IGNORED_STUBS.contains(&stub))
    {
        return false;
    }
    match &raw.message {
        Some(payload) => payload.protocol_message.is_none(),
        None => false,
    }
}

pub fn classify(raw: &RawMessage) -> (MessageKind, Option<String>) {
    match &raw.message {
        Some(payload) => classify_payload(payload),
        None => (
            MessageKind::Unknown {
                shape: "empty".to_string(),
            },
            None,
        ),
    }
}

fn buttons_summary(payload: &MessagePayload) -> Option<String> {
    if let Some(buttons) = &payload.buttons_message {
        let mut body = format!("*{}*", buttons.content_text.as_deref().unwrap_or_default());
        for button in &buttons.buttons {
            let label = button
                .button_text
                .as_ref()
                .and_then(|b| b.display_text.as_deref())
                .unwrap_or_default();
            body.push_str(&format!("\n\n{label}"));
        }
        return Some(body);
    }
    if let Some(list) = &payload.list_message {
        let mut body = format!("*{}*", list.description.as_deref().unwrap_or_default());
        for row in list.sections.iter().flat_map(|s| s.rows.iter()) {
            body.push_str(&format!("\n\n{}", row.title.as_deref().unwrap_or_default()));
        }
        return Some(body);
    }
    None
}

fn location_body(lat: f64, lng: f64, thumbnail: Option<&str>) -> String {
    let maps = format!("https://maps.google.com/maps?q={lat}%2C{lng}&z=17&hl=pt-BR|{lat}, {lng} ");
    match thumbnail {
        Some(thumb) if !thumb.is_empty() => format!("data:image/png;base64, {thumb} | {maps}"),
        _ => maps,
    }
}

fn classify_payload(p: &MessagePayload) -> (MessageKind, Option<String>) {
    if let Some(text) = &p.conversation {
        return (MessageKind::Conversation, Some(text.clone()));
    }
    if let Some(ext) = &p.extended_text_message {
        return (MessageKind::ExtendedText, ext.text.clone());
    }
    if let Some(edited) = &p.edited_message {
        let body = edited
            .message
            .as_deref()
            .and_then(|m| m.protocol_message.as_ref())
            .and_then(|pm| pm.edited_message.as_deref())
            .and_then(|m| {
                m.conversation
                    .clone()
                    .or_else(|| m.extended_text_message.as_ref().and_then(|e| e.text.clone()))
            });
        return (MessageKind::Edited, body);
    }
    if let Some(inner) = p.ephemeral_message.as_ref().and_then(|f| f.message.as_deref()) {
        return classify_payload(inner);
    }
    if let Some(inner) = p.view_once_message.as_ref().and_then(|f| f.message.as_deref()) {
        if let Some(summary) = buttons_summary(inner) {
            let kind = if inner.buttons_message.is_some() {
                MessageKind::Buttons
            } else {
                MessageKind::List
            };
            return (kind, Some(summary));
        }
        return classify_payload(inner);
    }
    if let Some(image) = &p.image_message {
        return (MessageKind::Image, image.caption.clone());
    }
    if let Some(video) = &p.video_message {
        return (MessageKind::Video, video.caption.clone());
    }
    if p.audio_message.is_some() {
        return (MessageKind::Audio, Some("Áudio".to_string()));
    }
    if p.sticker_message.is_some() {
        return (MessageKind::Sticker, Some("sticker".to_string()));
    }
    if let Some(doc) = &p.document_message {
        let body = doc.title.clone().or_else(|| doc.file_name.clone());
        return (MessageKind::Document, body);
    }
    if let Some(wrapper) = &p.document_with_caption_message {
        let body = wrapper
            .message
            .as_deref()
            .and_then(|m| m.document_message.as_ref())
            .and_then(|d| d.caption.clone().or_else(|| d.file_name.clone()));
        return (MessageKind::DocumentWithCaption, body);
    }
    if let Some(reply) = &p.buttons_response_message {
        return (MessageKind::ButtonsResponse, reply.selected_button_id.clone());
    }
    if let Some(reply) = &p.template_button_reply_message {
        return (MessageKind::TemplateButtonReply, reply.selected_id.clone());
    }
    if let Some(reply) = &p.list_response_message {
        let id = reply
            .single_select_reply
            .as_ref()
            .and_then(|r| r.selected_row_id.clone());
        return (MessageKind::ListResponse, id);
    }
    if let Some(summary) = buttons_summary(p) {
        let kind = if p.buttons_message.is_some() {
            MessageKind::Buttons
        } else {
            MessageKind::List
        };
        return (kind, Some(summary));
    }
    if let Some(contact) = &p.contact_message {
        return (MessageKind::Contact, contact.vcard.clone());
    }
    if p.contacts_array_message.is_some() {
        return (MessageKind::ContactsArray, Some("varios contatos".to_string()));
    }
    if let Some(loc) = &p.location_message {
        let body = location_body(
            loc.degrees_latitude.unwrap_or_default(),
            loc.degrees_longitude.unwrap_or_default(),
            loc.jpeg_thumbnail.as_deref(),
        );
        return (MessageKind::Location, Some(body));
    }
    if let Some(loc) = &p.live_location_message {
        let body = format!(
            "Latitude: {} - Longitude: {}",
            loc.degrees_latitude.unwrap_or_default(),
            loc.degrees_longitude.unwrap_or_default()
        );
        return (MessageKind::LiveLocation, Some(body));
    }
    if let Some(reaction) = &p.reaction_message {
        let body = reaction.text.clone().unwrap_or_else(|| "reaction".to_string());
        return (MessageKind::Reaction, Some(body));
    }

    let mut keys: Vec<&str> = p
        .other
        .keys()
        .map(String::as_str)
        .filter(|k| !ENVELOPE_KEYS.contains(k))
        .collect();
    keys.sort_unstable();
    let shape = if keys.is_empty() {
        "empty".to_string()
    } else {
        keys.join(",")
    };
    (MessageKind::Unknown { shape }, None)
}

fn context_info(p: &MessagePayload) -> Option<&ContextInfo> {
    if let Some(inner) = p.ephemeral_message.as_ref().and_then(|f| f.message.as_deref()) {
        return context_info(inner);
    }
    p.extended_text_message
        .as_ref()
        .and_then(|m| m.context_info.as_ref())
        .or_else(|| p.image_message.as_ref().and_then(|m| m.context_info.as_ref()))
        .or_else(|| p.video_message.as_ref().and_then(|m| m.context_info.as_ref()))
        .or_else(|| p.audio_message.as_ref().and_then(|m| m.context_info.as_ref()))
        .or_else(|| p.document_message.as_ref().and_then(|m| m.context_info.as_ref()))
        .or_else(|| p.buttons_response_message.as_ref().and_then(|m| m.context_info.as_ref()))
        .or_else(|| {
            p.template_button_reply_message
                .as_ref()
                .and_then(|m| m.context_info.as_ref())
        })
        .or_else(|| p.list_response_message.as_ref().and_then(|m| m.context_info.as_ref()))
}

/// External id of the message this one replies to.
pub fn quoted_message_id(raw: &RawMessage) -> Option<&str> {
    raw.message
        .as_ref()
        .and_then(context_info)
        .and_then(|c| c.stanza_id.as_deref())
}

/// Id of the original message an edit rewrites.
pub fn edited_target_id(raw: &RawMessage) -> Option<&str> {
    raw.message
        .as_ref()?
        .edited_message
        .as_ref()?
        .message
        .as_deref()?
        .protocol_message
        .as_ref()?
        .key
        .as_ref()?
        .id
        .as_deref()
}

/// Declared mimetype and original file name of the media part, if any.
pub fn media_details(raw: &RawMessage) -> (Option<String>, Option<String>) {
    fn walk(p: &MessagePayload) -> (Option<String>, Option<String>) {
        if let Some(inner) = p
            .ephemeral_message
            .as_ref()
            .or(p.view_once_message.as_ref())
            .or(p.document_with_caption_message.as_ref())
            .and_then(|f| f.message.as_deref())
        {
            return walk(inner);
        }
        if let Some(doc) = &p.document_message {
            return (doc.mimetype.clone(), doc.file_name.clone());
        }
        let media = p
            .image_message
            .as_ref()
            .or(p.video_message.as_ref())
            .or(p.audio_message.as_ref())
            .or(p.sticker_message.as_ref());
        (media.and_then(|m| m.mimetype.clone()), None)
    }
    raw.message.as_ref().map(walk).unwrap_or_default()
}

pub fn is_numeric(body: &str) -> bool {
    NUMERIC.is_match(body.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(message: serde_json::Value) -> RawMessage {
        serde_json::from_value(json!({
            "key": {"remoteJid": "5511999990000@s.whatsapp.net", "fromMe": false, "id": "M1"},
            "message": message
        }))
        .unwrap()
    }

    #[test]
    fn test_text_kinds() {
        let (kind, body) = classify(&raw(json!({"conversation": "oi"})));
        assert_eq!(kind, MessageKind::Conversation);
        assert_eq!(body.as_deref(), Some("oi"));

        let msg = raw(json!({"extendedTextMessage": {"text": "respondendo", "contextInfo": {"stanzaId": "Q1"}}}));
        let (kind, body) = classify(&msg);
        assert_eq!(kind.as_str(), "extendedTextMessage");
        assert_eq!(body.as_deref(), Some("respondendo"));
        assert_eq!(quoted_message_id(&msg), Some("Q1"));
    }

    #[test]
    fn test_interactive_replies_carry_selected_id() {
        let (kind, body) = classify(&raw(json!({"buttonsResponseMessage": {"selectedButtonId": "2"}})));
        assert_eq!(kind, MessageKind::ButtonsResponse);
        assert_eq!(body.as_deref(), Some("2"));

        let (_, body) = classify(&raw(json!({
            "listResponseMessage": {"singleSelectReply": {"selectedRowId": "#"}}
        })));
        assert_eq!(body.as_deref(), Some("#"));
    }

    #[test]
    fn test_list_summary() {
        let (kind, body) = classify(&raw(json!({
            "listMessage": {
                "description": "Escolha",
                "sections": [{"rows": [{"title": "Vendas"}, {"title": "Suporte"}]}]
            }
        })));
        assert_eq!(kind, MessageKind::List);
        assert_eq!(body.as_deref(), Some("*Escolha*\n\nVendas\n\nSuporte"));
    }

    #[test]
    fn test_edit_points_at_original() {
        let msg = raw(json!({
            "editedMessage": {"message": {"protocolMessage": {
                "key": {"id": "ORIG"},
                "type": 14,
                "editedMessage": {"conversation": "corrigido"}
            }}}
        }));
        let (kind, body) = classify(&msg);
        assert_eq!(kind, MessageKind::Edited);
        assert_eq!(body.as_deref(), Some("corrigido"));
        assert_eq!(edited_target_id(&msg), Some("ORIG"));
        assert!(is_processable(&msg));
    }

    #[test]
    fn test_media_kinds() {
        let msg = raw(json!({"ephemeralMessage": {"message": {
            "imageMessage": {"caption": "foto", "mimetype": "image/jpeg"}
        }}}));
        let (kind, body) = classify(&msg);
        assert_eq!(kind, MessageKind::Image);
        assert!(kind.has_media());
        assert_eq!(body.as_deref(), Some("foto"));
        assert_eq!(media_details(&msg).0.as_deref(), Some("image/jpeg"));

        let doc = raw(json!({"documentMessage": {"fileName": "nota.pdf", "mimetype": "application/pdf"}}));
        assert_eq!(classify(&doc).1.as_deref(), Some("nota.pdf"));
        assert_eq!(media_details(&doc).1.as_deref(), Some("nota.pdf"));
    }

    #[test]
    fn test_location_body() {
        let (_, body) = classify(&raw(json!({
            "locationMessage": {"degreesLatitude": -23.5, "degreesLongitude": -46.6, "jpegThumbnail": "AAA"}
        })));
        assert_eq!(
            body.as_deref(),
            Some("data:image/png;base64, AAA | https://maps.google.com/maps?q=-23.5%2C-46.6&z=17&hl=pt-BR|-23.5, -46.6 ")
        );
    }

    #[test]
    fn test_unknown_shape_is_reported() {
        let (kind, body) = classify(&raw(json!({
            "pollCreationMessageV3": {"name": "x"},
            "messageContextInfo": {}
        })));
        assert_eq!(
            kind,
            MessageKind::Unknown {
                shape: "pollCreationMessageV3".to_string()
            }
        );
        assert_eq!(kind.as_str(), "unknown");
        assert!(body.is_none());
    }

    #[test]
    fn test_processable_filters() {
        assert!(is_processable(&raw(json!({"conversation": "oi"}))));
        assert!(!is_processable(&raw(json!({"protocolMessage": {"type": 0}}))));

        let mut status = raw(json!({"conversation": "story"}));
        status.key.remote_jid = Some(STATUS_BROADCAST.to_string());
        assert!(!is_processable(&status));

        let mut stub = raw(json!({"conversation": "x"}));
        stub.message_stub_type = Some("REVOKE".to_string());
        assert!(!is_processable(&stub));

        let mut empty = raw(json!({}));
        empty.message = None;
        assert!(!is_processable(&empty));
    }

    #[test]
    fn test_numeric_bodies() {
        assert!(is_numeric("3"));
        assert!(is_numeric(" 12 "));
        assert!(is_numeric("-1"));
        assert!(!is_numeric("3a"));
        assert!(!is_numeric("٥"));
        assert!(!is_numeric(""));
    }
}
