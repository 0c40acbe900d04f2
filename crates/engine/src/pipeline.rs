//! One inbound or echoed message, from raw event to routed reply.

use crate::cache::unread_key;
use crate::identity::jid_digits;
use crate::media::StoredMedia;
use crate::normalizer::{classify, is_numeric, is_processable, MessageKind};
use crate::registry::Session;
use crate::routing::{bot_limited, decide, Route, RouteFacts, Turn};
use crate::settings::{ScheduleScope, TenantSettings};
use crate::template::format_body;
use crate::{Engine, BOT_MARKER};
use anyhow::Result;
use chrono::{Local, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use zapdesk_core::audit::report_exception;
use zapdesk_core::error::CrmError;
use zapdesk_core::protocol::RawMessage;
use zapdesk_core::types::{Channel, Contact, Ticket, TicketChanges};

impl Engine {
    #[instrument(skip_all, fields(channel_id = session.channel_id, message_id = %raw.external_id()))]
    pub async fn handle_message(&self, session: &Arc<Session>, raw: &RawMessage) -> Result<()> {
        if !is_processable(raw) {
            return Ok(());
        }
        let (kind, body) = classify(raw);
        if let MessageKind::Unknown { shape } = &kind {
            self.metrics.inc_unknown_payloads();
            warn!(shape = %shape, "Unrecognised message payload");
            report_exception(
                "unknown_payload",
                Some(session.tenant_id),
                json!({ "messageId": raw.external_id(), "shape": shape }),
            );
        }
        let body = body.unwrap_or_default();
        let from_me = raw.key.from_me;

        if from_me {
            // Our own automated sends come back as echoes.
            if body.contains(BOT_MARKER) {
                return Ok(());
            }
            if !kind.has_media() && !kind.is_typed_text() {
                return Ok(());
            }
        }

        let settings = TenantSettings::load(&self.store, session.tenant_id).await?;
        let is_group = raw.is_group();
        if is_group && settings.block_groups {
            debug!("Group messages disabled for tenant");
            return Ok(());
        }
        let channel = self
            .store
            .get_channel(session.channel_id)
            .await?
            .ok_or(CrmError::SessionNotFound)?;
        let transport = session.transport.as_ref();

        let group_contact = if is_group {
            let jid = raw.remote_jid();
            let subject = match transport.group_metadata(jid).await {
                Ok(meta) if !meta.subject.is_empty() => meta.subject,
                Ok(_) => jid_digits(jid),
                Err(e) => {
                    debug!(jid, error = %e, "Group metadata unavailable");
                    jid_digits(jid)
                }
            };
            Some(
                self.verify_contact(transport, session.tenant_id, channel.id, jid, &subject, true)
                    .await?,
            )
        } else {
            None
        };

        let sender = if is_group { raw.sender_jid() } else { raw.remote_jid() };
        let name = match raw.push_name.as_deref().filter(|n| !n.trim().is_empty()) {
            Some(push_name) if !from_me => push_name.to_string(),
            _ => jid_digits(sender),
        };
        let contact = self
            .verify_contact(transport, session.tenant_id, channel.id, sender, &name, false)
            .await?;
        if contact.ignore_messages || group_contact.as_ref().is_some_and(|g| g.ignore_messages) {
            debug!(contact_id = contact.id, "Contact is ignored");
            return Ok(());
        }

        let owner_id = group_contact.as_ref().map_or(contact.id, |g| g.id);
        let unread = if from_me {
            0
        } else {
            let current: i64 = self
                .cache
                .get(&unread_key(owner_id))
                .await
                .and_then(|v| v.parse().ok())
                .unwrap_or_default();
            current + 1
        };
        self.cache.set(&unread_key(owner_id), unread.to_string()).await;

        if unread == 0 && self.is_farewell_echo(&channel, &contact).await? {
            debug!(contact_id = contact.id, "Completion message echo; stopping");
            return Ok(());
        }

        let ticket = self
            .find_or_create_ticket(&contact, channel.id, unread, session.tenant_id, group_contact.as_ref())
            .await?;
        let open_tracking = self.store.find_open_tracking(ticket.id).await?;
        let queues = self.store.list_channel_queues(channel.id).await?;

        let facts = RouteFacts {
            from_me,
            is_group,
            numeric_body: is_numeric(&body),
            has_user: ticket.user_id.is_some(),
            has_queue: ticket.queue_id.is_some(),
            chatbot: ticket.chatbot,
            integration_active: ticket.use_integration
                && (ticket.integration_id.is_some() || ticket.prompt_id.is_some()),
            awaiting_queue_selection: ticket.awaiting_queue_selection,
            awaiting_rating: open_tracking.as_ref().is_some_and(|t| t.awaiting_rating()),
            channel_prompt: channel.prompt_id.is_some(),
            channel_integration: channel.integration_id.is_some(),
            queue_count: queues.len(),
            bot_limited: bot_limited(
                &channel,
                &ticket,
                open_tracking.as_ref().and_then(|t| t.chatbot_at),
                Utc::now(),
            ),
        };
        let route = decide(&facts);

        let media = self.fetch_media(session, raw, &kind).await;

        if let Some(tracking) = open_tracking.as_ref().filter(|_| route == Route::Rating) {
            let (_, ticket) = self
                .record_message(&ticket, &contact, raw, &kind, &body, media.as_ref(), false)
                .await?;
            self.handle_rating(session, &ticket, tracking, &contact, &channel, &body)
                .await?;
            return Ok(());
        }

        let ticket = self
            .patch_ticket(
                &ticket,
                TicketChanges {
                    from_me: Some(from_me),
                    ..Default::default()
                },
            )
            .await?;
        let (_, ticket) = self
            .record_message(&ticket, &contact, raw, &kind, &body, media.as_ref(), true)
            .await?;
        // After a reopen this is the fresh row, not the one closed with the ticket.
        let tracking = self.find_or_create_tracking(&ticket).await?;
        if from_me || kind == MessageKind::Edited {
            return Ok(());
        }
        self.mark_read(session, raw.key.clone());

        if !is_group && ticket.user_id.is_none() && self.hours_gate(&settings, &ticket, &channel).await? {
            return Ok(());
        }

        let turn = Turn {
            session,
            channel: &channel,
            contact: &contact,
            raw,
            kind: &kind,
            body: &body,
            media: media.as_ref(),
            settings: &settings,
            queues: &queues,
        };
        self.execute_route(route, &turn, ticket, &tracking).await
    }

    async fn fetch_media(&self, session: &Session, raw: &RawMessage, kind: &MessageKind) -> Option<StoredMedia> {
        if !kind.has_media() {
            return None;
        }
        match self
            .download_media(session.transport.as_ref(), raw, session.tenant_id)
            .await
        {
            Ok(media) => Some(media),
            Err(e) => {
                warn!(error = %e, "Media download failed; recording without media");
                None
            }
        }
    }

    /// True when the contact's last word equals our completion message,
    /// which means this is the tail of a conversation we already closed.
    async fn is_farewell_echo(&self, channel: &Channel, contact: &Contact) -> Result<bool> {
        let Some(completion) = channel.completion_message.as_deref().filter(|c| !c.is_empty()) else {
            return Ok(false);
        };
        let Some(last) = self
            .store
            .latest_contact_message(contact.tenant_id, contact.id)
            .await?
        else {
            return Ok(false);
        };
        let expected = format_body(completion, contact).trim().to_lowercase();
        Ok(expected == last.body.trim().to_lowercase())
    }

    /// Out of business hours: queue a (debounced) notice and stop routing.
    async fn hours_gate(&self, settings: &TenantSettings, ticket: &Ticket, channel: &Channel) -> Result<bool> {
        let now = Local::now().naive_local();
        let notice = match settings.schedule_scope {
            ScheduleScope::Disabled => return Ok(false),
            ScheduleScope::Company => {
                let Some(tenant) = self.store.get_tenant(ticket.tenant_id).await? else {
                    return Ok(false);
                };
                if crate::schedule::is_within_hours(&tenant.schedules, now) {
                    return Ok(false);
                }
                channel.out_of_hours_message.clone()
            }
            ScheduleScope::Queue => {
                let Some(queue_id) = ticket.queue_id else {
                    return Ok(false);
                };
                let Some(queue) = self.store.get_queue(queue_id).await? else {
                    return Ok(false);
                };
                if crate::schedule::is_within_hours(&queue.schedules, now) {
                    return Ok(false);
                }
                queue.out_of_hours_message
            }
        };

        debug!(ticket_id = ticket.id, "Outside business hours");
        if let Some(notice) = notice.filter(|n| !n.trim().is_empty()) {
            let engine = self.clone();
            let ticket_id = ticket.id;
            self.debouncer.debounce(
                format!("ooh:{ticket_id}"),
                Duration::from_millis(self.config.pipeline.out_of_hours_debounce_ms),
                move || async move {
                    engine
                        .send_text_later(ticket_id, format!("{BOT_MARKER} {notice}"))
                        .await
                },
            );
        }
        Ok(true)
    }
}
