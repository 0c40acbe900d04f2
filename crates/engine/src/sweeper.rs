//! Closes open tickets that went quiet after our last message.

use crate::Engine;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};
use zapdesk_core::error::CrmError;
use zapdesk_core::types::{Channel, Ticket, TicketChanges, TicketStatus, TrackingChanges};

impl Engine {
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        let engine = self.clone();
        let every = std::time::Duration::from_secs(self.config.pipeline.sweeper_interval_secs.max(1));
        tokio::spawn(async move {
            info!(interval_secs = every.as_secs(), "Inactivity sweeper started");
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                match engine.sweep_inactive_tickets(Utc::now()).await {
                    Ok(0) => {}
                    Ok(closed) => info!(closed, "Closed inactive tickets"),
                    Err(e) => error!(error = %e, "Inactivity sweep failed"),
                }
            }
        })
    }

    /// One pass over every channel with an inactivity limit. Returns how
    /// many tickets were closed.
    pub async fn sweep_inactive_tickets(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut closed = 0;
        for channel in self.store.list_channels().await? {
            if channel.expires_ticket <= 0 {
                continue;
            }
            let cutoff = now - Duration::minutes(channel.expires_ticket);
            for ticket in self.store.list_idle_open_tickets(channel.id, cutoff).await? {
                match self.expire_ticket(&channel, &ticket).await {
                    Ok(()) => closed += 1,
                    Err(e) => warn!(ticket_id = ticket.id, error = %e, "Failed to expire ticket"),
                }
            }
        }
        Ok(closed)
    }

    async fn expire_ticket(&self, channel: &Channel, ticket: &Ticket) -> Result<()> {
        let message = channel
            .expires_inactive_message
            .as_deref()
            .filter(|m| !m.trim().is_empty());
        let mut changes = TicketChanges {
            status: Some(TicketStatus::Closed),
            unread_messages: Some(0),
            ..Default::default()
        };
        if let Some(message) = message {
            changes.last_message = Some(format!("\u{200e} {message}"));
            changes.amount_used_bot_queues = Some(0);
        }
        let ticket = self.patch_ticket(ticket, changes).await?;

        if let Some(message) = message {
            let sent = async {
                let session = self.session(ticket.channel_id).await?;
                let contact = self
                    .store
                    .get_contact(ticket.contact_id)
                    .await?
                    .ok_or(CrmError::TicketNotFound)?;
                self.send_text(&session, &ticket, &contact, message).await?;
                anyhow::Ok(())
            };
            if let Err(e) = sent.await {
                warn!(ticket_id = ticket.id, error = %e, "Expiry message not delivered");
            }
        }

        if let Some(tracking) = self.store.find_open_tracking(ticket.id).await? {
            let now = Utc::now();
            self.store
                .update_tracking(
                    &tracking,
                    &TrackingChanges {
                        finished_at: Some(Some(now)),
                        closed_at: Some(Some(now)),
                        ..Default::default()
                    },
                )
                .await?;
        }
        self.emit_ticket_delete(&ticket, TicketStatus::Open.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixture_with;

    #[tokio::test]
    async fn test_idle_open_ticket_is_closed() {
        let fx = fixture_with(|c| {
            c.expires_ticket = 30;
            c.expires_inactive_message = Some("Encerramos por inatividade.".to_string());
        })
        .await;
        let contact = fx.contact("5511999990000").await;
        let ticket = fx.ticket(&contact).await;
        let ticket = fx
            .engine
            .patch_ticket(
                &ticket,
                TicketChanges {
                    status: Some(TicketStatus::Open),
                    from_me: Some(true),
                    unread_messages: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        fx.engine.find_or_create_tracking(&ticket).await.unwrap();
        let mut rx = fx.engine.bus.subscribe();

        assert_eq!(fx.engine.sweep_inactive_tickets(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + Duration::minutes(31);
        assert_eq!(fx.engine.sweep_inactive_tickets(later).await.unwrap(), 1);

        let ticket = fx.customer_ticket().await;
        assert_eq!(ticket.status, TicketStatus::Closed);
        assert_eq!(ticket.unread_messages, 0);
        assert_eq!(
            fx.transport.sent_texts(),
            vec!["\u{200e}Encerramos por inatividade.".to_string()]
        );
        let tracking = fx.engine.store.latest_tracking(ticket.id).await.unwrap().unwrap();
        assert!(tracking.finished_at.is_some());
        assert!(tracking.closed_at.is_some());

        let mut rooms = vec![];
        while let Ok(note) = rx.try_recv() {
            if note.payload["action"] == "delete" {
                rooms.extend(note.rooms);
            }
        }
        assert_eq!(rooms, vec!["open".to_string()]);
    }

    #[tokio::test]
    async fn test_channels_without_limit_are_skipped() {
        let fx = fixture_with(|_| {}).await;
        let contact = fx.contact("5511999990000").await;
        let ticket = fx.ticket(&contact).await;
        fx.engine
            .patch_ticket(
                &ticket,
                TicketChanges {
                    status: Some(TicketStatus::Open),
                    from_me: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let later = Utc::now() + Duration::days(2);
        assert_eq!(fx.engine.sweep_inactive_tickets(later).await.unwrap(), 0);
    }
}
