use crate::media::StoredMedia;
use crate::normalizer::{edited_target_id, quoted_message_id, MessageKind};
use crate::settings::TenantSettings;
use crate::Engine;
use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use zapdesk_core::bus::{message_event, ticket_event, ROOM_NOTIFICATION};
use zapdesk_core::error::CrmError;
use zapdesk_core::protocol::RawMessage;
use zapdesk_core::types::{
    Contact, Message, NewMessage, Ticket, TicketChanges, TicketStatus, TicketTracking,
    TrackingChanges,
};

const CAS_ATTEMPTS: usize = 3;

pub const RATING_PROMPT: &str = "Digite de 1 a 5 para qualificar nosso atendimento:\n\n*5* - 😊 _Ótimo_\n*4* - 🙂 _Bom_\n*3* - 😐 _Neutro_\n*2* - 😕 _Ruim_\n*1* - 😞 _Péssimo_";

const TRANSFER_HEADER: &str = "*Mensagem automática*:\nVocê foi transferido para o";
const TRANSFER_FOOTER: &str = "\nAguarde um momento, por favor. Iremos te atender em breve!";

/// Agent-side ticket edit. Unset fields keep their value, except `chatbot`
/// and `queue_option_id` which reset unless given.
#[derive(Debug, Clone, Default)]
pub struct TicketUpdate {
    pub status: Option<TicketStatus>,
    pub user_id: Option<Option<i64>>,
    pub queue_id: Option<Option<i64>>,
    pub chatbot: Option<bool>,
    pub queue_option_id: Option<i64>,
    pub use_integration: Option<bool>,
    pub integration_id: Option<Option<i64>>,
    pub prompt_id: Option<Option<i64>>,
    pub unread_messages: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct TicketUpdateOutcome {
    pub ticket: Ticket,
    pub old_status: TicketStatus,
    pub old_user_id: Option<i64>,
}

/// Text telling the customer who now handles the ticket, if anything moved.
pub fn transfer_notice(
    old_queue: Option<i64>,
    new_queue: Option<i64>,
    old_user: Option<i64>,
    new_user: Option<i64>,
    queue_name: &str,
    user_name: &str,
) -> Option<String> {
    let queue_moved = old_queue != new_queue && new_queue.is_some();
    let user_moved = old_user != new_user && old_user.is_some() && new_user.is_some();

    if queue_moved && old_queue.is_some() && old_user == new_user {
        Some(format!("{TRANSFER_HEADER} departamento *{queue_name}*{TRANSFER_FOOTER}"))
    } else if user_moved && old_queue == new_queue {
        Some(format!("{TRANSFER_HEADER} atendente *{user_name}*.{TRANSFER_FOOTER}"))
    } else if user_moved && queue_moved && old_queue.is_some() {
        Some(format!(
            "{TRANSFER_HEADER} departamento *{queue_name}* e será atendido por *{user_name}*.{TRANSFER_FOOTER}"
        ))
    } else if old_user.is_some() && new_user.is_none() && queue_moved {
        Some(format!("{TRANSFER_HEADER} departamento *{queue_name}*{TRANSFER_FOOTER}"))
    } else {
        None
    }
}

impl Engine {
    pub(crate) fn emit_ticket_update<I, S>(&self, ticket: &Ticket, rooms: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bus.emit_to_rooms(
            rooms,
            &ticket_event(ticket.tenant_id),
            json!({ "action": "update", "ticket": ticket }),
        );
    }

    pub(crate) fn emit_ticket_delete(&self, ticket: &Ticket, room: &str) {
        self.bus.emit_to_room(
            room,
            &ticket_event(ticket.tenant_id),
            json!({ "action": "delete", "ticketId": ticket.id }),
        );
    }

    /// Apply `changes` with optimistic concurrency, reloading on a lost race.
    pub async fn patch_ticket(&self, ticket: &Ticket, changes: TicketChanges) -> Result<Ticket> {
        if changes.is_empty() {
            return Ok(ticket.clone());
        }
        let mut current = ticket.clone();
        for attempt in 1..=CAS_ATTEMPTS {
            if let Some(updated) = self.store.compare_and_swap_ticket(&current, &changes).await? {
                return Ok(updated);
            }
            debug!(ticket_id = ticket.id, attempt, "Ticket version moved; reloading");
            current = self
                .store
                .get_ticket(ticket.id)
                .await?
                .ok_or(CrmError::TicketNotFound)?;
        }
        warn!(ticket_id = ticket.id, "Gave up patching ticket after repeated conflicts");
        Err(CrmError::TicketConflict.into())
    }

    /// Latest ticket of the contact on this channel, or a fresh pending one.
    #[instrument(skip(self, contact, group_contact), fields(contact_id = contact.id))]
    pub async fn find_or_create_ticket(
        &self,
        contact: &Contact,
        channel_id: i64,
        unread_messages: i64,
        tenant_id: i64,
        group_contact: Option<&Contact>,
    ) -> Result<Ticket> {
        let owner = group_contact.unwrap_or(contact);
        if let Some(existing) = self
            .store
            .find_latest_ticket(tenant_id, owner.id, channel_id)
            .await?
        {
            let mut changes = TicketChanges {
                unread_messages: Some(unread_messages),
                ..Default::default()
            };
            if existing.status == TicketStatus::Closed {
                changes.queue_id = Some(None);
                changes.user_id = Some(None);
                changes.queue_option_id = Some(None);
                changes.awaiting_queue_selection = Some(false);
            }
            return self.patch_ticket(&existing, changes).await;
        }

        let ticket = self
            .store
            .create_ticket(tenant_id, owner.id, channel_id, group_contact.is_some(), unread_messages)
            .await?;
        info!(ticket_id = ticket.id, "Ticket created");
        self.emit_ticket_update(&ticket, [TicketStatus::Pending.as_str(), ROOM_NOTIFICATION]);
        Ok(ticket)
    }

    pub async fn find_or_create_tracking(&self, ticket: &Ticket) -> Result<TicketTracking> {
        if let Some(tracking) = self.store.find_open_tracking(ticket.id).await? {
            return Ok(tracking);
        }
        self.store
            .create_tracking(ticket.id, ticket.tenant_id, Some(ticket.channel_id), ticket.user_id)
            .await
    }

    /// Close the contact's open or pending tickets on other channels.
    async fn check_contact_open_tickets(&self, ticket: &Ticket) -> Result<()> {
        let others = self
            .store
            .find_active_tickets_elsewhere(ticket.contact_id, ticket.channel_id, ticket.id)
            .await?;
        for other in others {
            let old_status = other.status;
            let closed = self
                .patch_ticket(
                    &other,
                    TicketChanges {
                        status: Some(TicketStatus::Closed),
                        ..Default::default()
                    },
                )
                .await?;
            info!(ticket_id = closed.id, "Closed ticket left open on another channel");
            self.emit_ticket_delete(&closed, old_status.as_str());
        }
        Ok(())
    }

    async fn notify_contact(&self, ticket: &Ticket, contact: &Contact, body: &str) -> bool {
        let session = match self.session(ticket.channel_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(ticket_id = ticket.id, error = %e, "No session to notify the contact");
                return false;
            }
        };
        match self.send_text(&session, ticket, contact, body).await {
            Ok(_) => true,
            Err(e) => {
                warn!(ticket_id = ticket.id, error = %e, "Failed to notify the contact");
                false
            }
        }
    }

    /// Agent-facing ticket update with its tracking and notification side effects.
    #[instrument(skip(self, update))]
    pub async fn update_ticket(&self, ticket_id: i64, update: TicketUpdate) -> Result<TicketUpdateOutcome> {
        let ticket = self
            .store
            .get_ticket(ticket_id)
            .await?
            .ok_or(CrmError::TicketNotFound)?;
        let old_status = ticket.status;
        let old_user_id = ticket.user_id;
        let old_queue_id = ticket.queue_id;
        let tracking = self.find_or_create_tracking(&ticket).await?;
        let settings = TenantSettings::load(&self.store, ticket.tenant_id).await?;

        let mut changes = TicketChanges {
            status: update.status,
            user_id: update.user_id,
            queue_id: update.queue_id,
            queue_option_id: Some(update.queue_option_id),
            chatbot: Some(update.chatbot.unwrap_or(false)),
            use_integration: update.use_integration,
            integration_id: update.integration_id,
            prompt_id: update.prompt_id,
            unread_messages: update.unread_messages,
            awaiting_queue_selection: update.queue_id.map(|_| false),
            ..Default::default()
        };
        if old_status == TicketStatus::Closed {
            self.check_contact_open_tickets(&ticket).await?;
            changes.chatbot = Some(false);
            changes.queue_option_id = Some(None);
        }
        let closing = update.status == Some(TicketStatus::Closed);
        if closing {
            changes.prompt_id = Some(None);
            changes.integration_id = Some(None);
            changes.use_integration = Some(false);
            changes.awaiting_queue_selection = Some(false);
        }

        let updated = self.patch_ticket(&ticket, changes).await?;
        let contact = self
            .store
            .get_contact(updated.contact_id)
            .await?
            .ok_or(CrmError::TicketNotFound)?;
        let now = Utc::now();
        let mut tracking_changes = TrackingChanges::default();

        if closing {
            let channel = self.store.get_channel(updated.channel_id).await?;
            let tracked_user = tracking.user_id.or(old_user_id);
            if settings.user_rating && tracking.rating_at.is_none() && tracked_user.is_some() {
                let intro = channel
                    .as_ref()
                    .and_then(|c| c.rating_message.as_deref())
                    .filter(|m| !m.is_empty())
                    .map(|m| format!("{m}\n\n"))
                    .unwrap_or_default();
                if self
                    .notify_contact(&updated, &contact, &format!("{intro}{RATING_PROMPT}"))
                    .await
                {
                    tracking_changes.rating_at = Some(Some(now));
                    tracking_changes.rated = Some(false);
                } else {
                    tracking_changes.finished_at = Some(Some(now));
                }
            } else {
                tracking_changes.finished_at = Some(Some(now));
                if let Some(completion) = channel
                    .as_ref()
                    .and_then(|c| c.completion_message.as_deref())
                    .filter(|m| !m.is_empty())
                {
                    self.notify_contact(&updated, &contact, completion).await;
                }
            }
            tracking_changes.closed_at = Some(Some(now));
            tracking_changes.user_id = Some(updated.user_id.or(old_user_id));
        }

        if matches!(update.queue_id, Some(Some(_))) {
            tracking_changes.queued_at = Some(Some(now));
        }

        if settings.transfer_notifications {
            let queue_name = match updated.queue_id {
                Some(id) => self.store.get_queue(id).await?.map(|q| q.name),
                None => None,
            };
            let user_name = match updated.user_id {
                Some(id) => self.store.get_user(id).await?.map(|u| u.name),
                None => None,
            };
            if let Some(notice) = transfer_notice(
                old_queue_id,
                updated.queue_id,
                old_user_id,
                updated.user_id,
                queue_name.as_deref().unwrap_or_default(),
                user_name.as_deref().unwrap_or_default(),
            ) {
                self.notify_contact(&updated, &contact, &notice).await;
            }
        }

        match update.status {
            Some(TicketStatus::Pending) => {
                tracking_changes.queued_at = Some(Some(now));
                tracking_changes.started_at = Some(None);
                tracking_changes.user_id = Some(None);
            }
            Some(TicketStatus::Open) => {
                tracking_changes.started_at = Some(Some(now));
                tracking_changes.rating_at = Some(None);
                tracking_changes.rated = Some(false);
                tracking_changes.user_id = Some(updated.user_id);
            }
            _ => {}
        }
        if tracking_changes != TrackingChanges::default() {
            self.store.update_tracking(&tracking, &tracking_changes).await?;
        }

        let ticket = self.store.get_ticket(updated.id).await?.unwrap_or(updated);
        if ticket.status != old_status || ticket.user_id != old_user_id {
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

        Ok(TicketUpdateOutcome {
            ticket,
            old_status,
            old_user_id,
        })
    }

    /// A customer writing to a closed ticket puts it back in the pending
    /// lane with a fresh tracking row.
    pub(crate) async fn reopen_ticket(&self, ticket: &Ticket) -> Result<Ticket> {
        let reopened = self
            .patch_ticket(
                ticket,
                TicketChanges {
                    status: Some(TicketStatus::Pending),
                    ..Default::default()
                },
            )
            .await?;
        if let Some(open) = self.store.find_open_tracking(ticket.id).await? {
            self.store
                .update_tracking(
                    &open,
                    &TrackingChanges {
                        finished_at: Some(Some(Utc::now())),
                        ..Default::default()
                    },
                )
                .await?;
        }
        self.store
            .create_tracking(ticket.id, ticket.tenant_id, Some(ticket.channel_id), None)
            .await?;
        info!(ticket_id = ticket.id, "Closed ticket reopened as pending");

        self.emit_ticket_delete(&reopened, TicketStatus::Closed.as_str());
        self.emit_ticket_update(
            &reopened,
            [TicketStatus::Pending.as_str().to_string(), reopened.id.to_string()],
        );
        Ok(reopened)
    }

    /// Persist a message on the ticket, refresh its preview and notify the UI.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn record_message(
        &self,
        ticket: &Ticket,
        contact: &Contact,
        raw: &RawMessage,
        kind: &MessageKind,
        body: &str,
        media: Option<&StoredMedia>,
        reopen: bool,
    ) -> Result<(Message, Ticket)> {
        let from_me = raw.key.from_me;
        let (id, is_edited) = match kind {
            MessageKind::Edited => (
                edited_target_id(raw).unwrap_or(raw.external_id()).to_string(),
                true,
            ),
            _ => (raw.external_id().to_string(), false),
        };
        let quoted_msg_id = match quoted_message_id(raw) {
            Some(q) if self.store.message_exists(q, ticket.tenant_id).await? => Some(q.to_string()),
            _ => None,
        };

        let message = self
            .store
            .upsert_message(&NewMessage {
                id,
                tenant_id: ticket.tenant_id,
                ticket_id: ticket.id,
                contact_id: (!from_me).then_some(contact.id),
                body: body.to_string(),
                from_me,
                read: from_me,
                media_url: media.map(|m| m.file_name.clone()),
                media_type: media
                    .map(|m| m.media_type().to_string())
                    .unwrap_or_else(|| kind.as_str().to_string()),
                quoted_msg_id,
                ack: raw.status.unwrap_or_default(),
                remote_jid: raw.key.remote_jid.clone(),
                participant: raw.key.participant.clone().or_else(|| raw.participant.clone()),
                data_json: serde_json::to_string(raw).ok(),
                is_edited,
            })
            .await?;

        let mut ticket = self
            .patch_ticket(
                ticket,
                TicketChanges {
                    last_message: Some(body.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        if from_me {
            self.metrics.inc_messages_out();
        } else {
            self.metrics.inc_messages_in();
        }
        let action = if is_edited { "update" } else { "create" };
        self.bus.emit_to_rooms(
            [
                ticket.id.to_string(),
                ticket.status.as_str().to_string(),
                ROOM_NOTIFICATION.to_string(),
            ],
            &message_event(ticket.tenant_id),
            json!({ "action": action, "message": message, "ticket": ticket, "contact": contact }),
        );

        if reopen && !from_me && ticket.status == TicketStatus::Closed {
            ticket = self.reopen_ticket(&ticket).await?;
        }
        Ok((message, ticket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixture;
    use zapdesk_core::bus::Notification;

    #[test]
    fn test_transfer_notices() {
        assert_eq!(
            transfer_notice(Some(1), Some(2), None, None, "Vendas", ""),
            Some("*Mensagem automática*:\nVocê foi transferido para o departamento *Vendas*\nAguarde um momento, por favor. Iremos te atender em breve!".to_string())
        );
        assert_eq!(
            transfer_notice(Some(1), Some(1), Some(3), Some(4), "Vendas", "Ana"),
            Some("*Mensagem automática*:\nVocê foi transferido para o atendente *Ana*.\nAguarde um momento, por favor. Iremos te atender em breve!".to_string())
        );
        assert!(transfer_notice(Some(1), Some(2), Some(3), Some(4), "Vendas", "Ana")
            .unwrap()
            .contains("departamento *Vendas* e será atendido por *Ana*."));
        assert!(transfer_notice(None, Some(2), Some(3), None, "Vendas", "")
            .unwrap()
            .contains("departamento *Vendas*"));
        assert_eq!(transfer_notice(None, None, None, Some(4), "", "Ana"), None);
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<Notification>) -> Vec<Notification> {
        let mut seen = Vec::new();
        while let Ok(n) = rx.try_recv() {
            seen.push(n);
        }
        seen
    }

    #[tokio::test]
    async fn test_existing_ticket_is_reused() {
        let fx = fixture().await;
        let contact = fx.contact("5511999990000").await;
        let first = fx
            .engine
            .find_or_create_ticket(&contact, fx.channel.id, 1, fx.tenant.id, None)
            .await
            .unwrap();
        let second = fx
            .engine
            .find_or_create_ticket(&contact, fx.channel.id, 2, fx.tenant.id, None)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, TicketStatus::Pending);
        assert_eq!(second.unread_messages, 2);
    }

    #[tokio::test]
    async fn test_stale_copy_still_patches() {
        let fx = fixture().await;
        let contact = fx.contact("5511999990000").await;
        let stale = fx.ticket(&contact).await;

        fx.engine
            .patch_ticket(&stale, TicketChanges { chatbot: Some(true), ..Default::default() })
            .await
            .unwrap();
        let patched = fx
            .engine
            .patch_ticket(&stale, TicketChanges { unread_messages: Some(5), ..Default::default() })
            .await
            .unwrap();

        assert!(patched.chatbot);
        assert_eq!(patched.unread_messages, 5);
        assert!(patched.version > stale.version);
    }

    #[tokio::test]
    async fn test_open_then_close_finishes_tracking_once() {
        let fx = fixture_with_completion().await;
        let contact = fx.contact("5511999990000").await;
        let ticket = fx.ticket(&contact).await;
        let user = fx.engine.store.create_user(fx.tenant.id, "Ana").await.unwrap();

        let opened = fx
            .engine
            .update_ticket(
                ticket.id,
                TicketUpdate {
                    status: Some(TicketStatus::Open),
                    user_id: Some(Some(user.id)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(opened.old_status, TicketStatus::Pending);
        let tracking = fx.engine.store.find_open_tracking(ticket.id).await.unwrap().unwrap();
        assert_eq!(tracking.user_id, Some(user.id));
        assert!(tracking.started_at.is_some());

        let mut rx = fx.engine.bus.subscribe();
        let closed = fx
            .engine
            .update_ticket(
                ticket.id,
                TicketUpdate {
                    status: Some(TicketStatus::Closed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(closed.ticket.status, TicketStatus::Closed);
        assert_eq!(fx.transport.sent_texts(), vec!["\u{200e}Até logo!".to_string()]);

        let tracking = fx.engine.store.latest_tracking(ticket.id).await.unwrap().unwrap();
        assert!(tracking.finished_at.is_some());
        assert!(tracking.closed_at.is_some());
        assert!(!tracking.awaiting_rating());
        assert!(fx.engine.store.find_open_tracking(ticket.id).await.unwrap().is_none());

        let events = drain(&mut rx);
        assert!(events.iter().any(|n| n.rooms == vec!["open".to_string()]
            && n.payload["action"] == "delete"));
        assert!(events.iter().any(|n| n.rooms.contains(&"closed".to_string())
            && n.payload["action"] == "update"));
    }

    async fn fixture_with_completion() -> crate::testing::Fixture {
        crate::testing::fixture_with(|c| c.completion_message = Some("Até logo!".to_string())).await
    }

    #[tokio::test]
    async fn test_close_with_rating_enabled_asks_for_rating() {
        let fx = fixture_with_completion().await;
        fx.setting("userRating", "enabled").await;
        let contact = fx.contact("5511999990000").await;
        let ticket = fx.ticket(&contact).await;
        let user = fx.engine.store.create_user(fx.tenant.id, "Ana").await.unwrap();

        for status in [TicketStatus::Open, TicketStatus::Closed] {
            fx.engine
                .update_ticket(
                    ticket.id,
                    TicketUpdate {
                        status: Some(status),
                        user_id: Some(Some(user.id)),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let sent = fx.transport.sent_texts();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("Digite de 1 a 5"));
        let tracking = fx.engine.store.latest_tracking(ticket.id).await.unwrap().unwrap();
        assert!(tracking.awaiting_rating());
    }

    #[tokio::test]
    async fn test_reopen_moves_closed_ticket_to_pending() {
        let fx = fixture().await;
        let contact = fx.contact("5511999990000").await;
        let ticket = fx.ticket(&contact).await;
        let closed = fx
            .engine
            .patch_ticket(&ticket, TicketChanges { status: Some(TicketStatus::Closed), ..Default::default() })
            .await
            .unwrap();
        fx.engine.find_or_create_tracking(&closed).await.unwrap();

        let mut rx = fx.engine.bus.subscribe();
        let reopened = fx.engine.reopen_ticket(&closed).await.unwrap();
        assert_eq!(reopened.status, TicketStatus::Pending);
        assert_eq!(reopened.id, ticket.id);

        let events = drain(&mut rx);
        assert_eq!(events[0].rooms, vec!["closed".to_string()]);
        assert_eq!(events[0].payload["action"], "delete");
        assert!(events[1].rooms.contains(&"pending".to_string()));
    }
}
