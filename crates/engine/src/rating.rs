use crate::registry::Session;
use crate::Engine;
use anyhow::Result;
use chrono::Utc;
use tracing::info;
use zapdesk_core::bus::ROOM_NOTIFICATION;
use zapdesk_core::types::{
    Channel, Contact, Ticket, TicketChanges, TicketStatus, TicketTracking, TrackingChanges,
};

pub fn clamp_rate(value: i64) -> i64 {
    value.clamp(1, 5)
}

/// Digits too long for an i64 saturate toward their sign.
fn parse_rate(answer: &str) -> i64 {
    let answer = answer.trim();
    let fallback = if answer.starts_with('-') { i64::MIN } else { i64::MAX };
    clamp_rate(answer.parse().unwrap_or(fallback))
}

impl Engine {
    /// Store the customer's 1..5 answer and finish the ticket for good.
    pub(crate) async fn handle_rating(
        &self,
        session: &Session,
        ticket: &Ticket,
        tracking: &TicketTracking,
        contact: &Contact,
        channel: &Channel,
        answer: &str,
    ) -> Result<Ticket> {
        let rate = parse_rate(answer);
        self.store
            .create_user_rating(ticket.id, ticket.tenant_id, tracking.user_id, rate)
            .await?;
        info!(ticket_id = ticket.id, rate, "Rating recorded");

        let mut ticket = ticket.clone();
        if let Some(completion) = channel.completion_message.as_deref().filter(|m| !m.is_empty()) {
            ticket = self.send_text(session, &ticket, contact, completion).await?.1;
        }

        self.store
            .update_tracking(
                tracking,
                &TrackingChanges {
                    finished_at: Some(Some(Utc::now())),
                    rated: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let old_status = ticket.status;
        let ticket = self
            .patch_ticket(
                &ticket,
                TicketChanges {
                    queue_id: Some(None),
                    queue_option_id: Some(None),
                    chatbot: Some(false),
                    user_id: Some(None),
                    status: Some(TicketStatus::Closed),
                    awaiting_queue_selection: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        self.emit_ticket_delete(&ticket, TicketStatus::Open.as_str());
        if old_status != TicketStatus::Open {
            self.emit_ticket_delete(&ticket, old_status.as_str());
        }
        self.emit_ticket_update(
            &ticket,
            [
                ticket.status.as_str().to_string(),
                ROOM_NOTIFICATION.to_string(),
                ticket.id.to_string(),
            ],
        );
        Ok(ticket)
    }
}
