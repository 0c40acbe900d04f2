use crate::media::StoredMedia;
use crate::normalizer::MessageKind;
use crate::registry::Session;
use crate::template::format_body;
use crate::{Engine, BOT_MARKER};
use anyhow::Result;
use serde_json::json;
use tracing::{debug, warn};
use zapdesk_core::audit::report_exception;
use zapdesk_core::error::CrmError;
use zapdesk_core::transport::OutboundContent;
use zapdesk_core::types::{Contact, Message, Ticket};

/// Prefix the automated-message marker unless already present.
pub fn mark_automated(body: &str) -> String {
    if body.starts_with(BOT_MARKER) {
        body.to_string()
    } else {
        format!("{BOT_MARKER}{body}")
    }
}

impl Engine {
    async fn target_jid(&self, session: &Session, ticket: &Ticket, contact: &Contact) -> String {
        if ticket.is_group || contact.is_group {
            return format!("{}@g.us", contact.number);
        }
        if let Some(preferred) = contact.preferred_id.as_deref().filter(|p| !p.is_empty()) {
            return preferred.to_string();
        }
        self.identity
            .preferred_jid(session.transport.as_ref(), &contact.number)
            .await
    }

    /// Deliver `content` to the ticket's contact and record it as ours.
    pub async fn send_content(
        &self,
        session: &Session,
        ticket: &Ticket,
        contact: &Contact,
        content: OutboundContent,
        media: Option<&StoredMedia>,
    ) -> Result<(Message, Ticket)> {
        let jid = self.target_jid(session, ticket, contact).await;
        let mut sent = match session.transport.send_message(&jid, &content).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(ticket_id = ticket.id, to = %jid, error = %e, "Outbound message failed");
                report_exception(
                    "send_message",
                    Some(ticket.tenant_id),
                    json!({ "ticketId": ticket.id, "to": jid, "error": e.to_string() }),
                );
                return Err(CrmError::SendFailed.into());
            }
        };
        if sent.external_id().is_empty() {
            sent.key.id = Some(uuid::Uuid::new_v4().simple().to_string().to_uppercase());
        }
        sent.key.from_me = true;
        debug!(ticket_id = ticket.id, message_id = %sent.external_id(), "Outbound message sent");

        let kind = match &content {
            OutboundContent::Audio { .. } => MessageKind::Audio,
            OutboundContent::Image { .. } => MessageKind::Image,
            OutboundContent::Reaction { .. } => MessageKind::Reaction,
            _ => MessageKind::Conversation,
        };
        self.record_message(ticket, contact, &sent, &kind, &content.preview(), media, false)
            .await
    }

    /// Render, mark and send an automated text.
    pub async fn send_text(
        &self,
        session: &Session,
        ticket: &Ticket,
        contact: &Contact,
        body: &str,
    ) -> Result<(Message, Ticket)> {
        let text = mark_automated(&format_body(body, contact));
        self.send_content(session, ticket, contact, OutboundContent::text(text), None)
            .await
    }

    /// Send to a ticket by id, reloading it first. Used from delayed tasks,
    /// so failures are logged rather than returned.
    pub(crate) async fn send_text_later(&self, ticket_id: i64, body: String) {
        let result: Result<()> = async {
            let ticket = self
                .store
                .get_ticket(ticket_id)
                .await?
                .ok_or(CrmError::TicketNotFound)?;
            let contact = self
                .store
                .get_contact(ticket.contact_id)
                .await?
                .ok_or(CrmError::TicketNotFound)?;
            let session = self.session(ticket.channel_id).await?;
            self.send_text(&session, &ticket, &contact, &body).await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(ticket_id, error = %e, "Delayed send failed");
        }
    }
}
