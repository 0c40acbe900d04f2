//! Voice and video calls on channels whose tenant turned calls off.

use crate::identity::jid_digits;
use crate::registry::Session;
use crate::settings::TenantSettings;
use crate::Engine;
use anyhow::Result;
use chrono::{Local, Timelike};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use zapdesk_core::bus::{message_event, ROOM_NOTIFICATION};
use zapdesk_core::protocol::CallOffer;
use zapdesk_core::transport::OutboundContent;
use zapdesk_core::types::{NewMessage, TicketChanges, TicketStatus};

pub const CALLS_DISABLED_NOTICE: &str = "*Mensagem Automática:*\nAs chamadas de voz e vídeo estão desabilitadas para este WhatsApp. Por favor, envie uma mensagem de texto.";

pub fn missed_call_body(hour: u32, minute: u32) -> String {
    format!("Chamada de voz/vídeo perdida às {hour:02}:{minute:02}")
}

impl Engine {
    pub async fn handle_calls(&self, session: &Arc<Session>, calls: Vec<CallOffer>) -> Result<()> {
        let settings = TenantSettings::load(&self.store, session.tenant_id).await?;
        if settings.calls_enabled {
            return Ok(());
        }

        for call in calls {
            if call.status.as_deref().is_some_and(|s| s != "offer") {
                continue;
            }
            if let Err(e) = session.transport.reject_call(&call.id, &call.from).await {
                warn!(call_id = %call.id, error = %e, "Failed to reject call");
            }
            info!(channel_id = session.channel_id, from = %call.from, "Rejected incoming call");

            let engine = self.clone();
            let session = session.clone();
            self.debouncer.debounce(
                format!("call:{}", call.from),
                Duration::from_millis(self.config.pipeline.call_notice_debounce_ms),
                move || async move {
                    if let Err(e) = engine.notify_missed_call(&session, &call.from).await {
                        warn!(from = %call.from, error = %e, "Missed call handling failed");
                    }
                },
            );
        }
        Ok(())
    }

    async fn notify_missed_call(&self, session: &Session, from: &str) -> Result<()> {
        session
            .transport
            .send_message(from, &OutboundContent::text(CALLS_DISABLED_NOTICE))
            .await?;

        let digits = jid_digits(from);
        let Some(contact) = self.store.find_contact_by_number(session.tenant_id, &digits).await? else {
            debug!(from, "Caller is not a known contact");
            return Ok(());
        };
        let Some(ticket) = self
            .store
            .find_latest_ticket(session.tenant_id, contact.id, session.channel_id)
            .await?
        else {
            return Ok(());
        };

        let now = Local::now();
        let body = missed_call_body(now.hour(), now.minute());
        let message = self
            .store
            .upsert_message(&NewMessage {
                id: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
                tenant_id: ticket.tenant_id,
                ticket_id: ticket.id,
                contact_id: Some(contact.id),
                body: body.clone(),
                from_me: false,
                read: true,
                media_type: "call_log".to_string(),
                remote_jid: Some(from.to_string()),
                ..Default::default()
            })
            .await?;
        let mut ticket = self
            .patch_ticket(
                &ticket,
                TicketChanges {
                    last_message: Some(body),
                    ..Default::default()
                },
            )
            .await?;
        self.bus.emit_to_rooms(
            [ticket.id.to_string(), ticket.status.as_str().to_string(), ROOM_NOTIFICATION.to_string()],
            &message_event(ticket.tenant_id),
            json!({ "action": "create", "message": message, "ticket": ticket, "contact": contact }),
        );

        if ticket.status == TicketStatus::Closed {
            ticket = self.reopen_ticket(&ticket).await?;
        }
        debug!(ticket_id = ticket.id, "Missed call logged");
        Ok(())
    }
}
