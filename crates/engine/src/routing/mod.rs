//! Decides what automated step, if any, answers an inbound message.
//!
//! The decision is a pure function of [`RouteFacts`]; an ordered rule table
//! maps facts to a [`Route`] and the engine then executes it.

mod integrations;
mod menu;

pub use menu::{option_menu, queue_menu_text};

use crate::media::StoredMedia;
use crate::normalizer::MessageKind;
use crate::registry::Session;
use crate::schedule::{is_within_hours, todays_entry};
use crate::settings::TenantSettings;
use crate::template::format_body;
use crate::Engine;
use anyhow::Result;
use chrono::{DateTime, Duration, Local, Utc};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};
use zapdesk_core::audit::report_exception;
use zapdesk_core::protocol::RawMessage;
use zapdesk_core::types::{
    Channel, Contact, Queue, Ticket, TicketChanges, TicketTracking, TrackingChanges,
};

/// Everything routing needs to know about the message and its ticket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteFacts {
    pub from_me: bool,
    pub is_group: bool,
    pub numeric_body: bool,
    pub has_user: bool,
    pub has_queue: bool,
    pub chatbot: bool,
    pub integration_active: bool,
    pub awaiting_queue_selection: bool,
    pub awaiting_rating: bool,
    pub channel_prompt: bool,
    pub channel_integration: bool,
    pub queue_count: usize,
    pub bot_limited: bool,
}

impl RouteFacts {
    /// Bots only ever talk to an unassigned, one-to-one customer.
    fn automatable(&self) -> bool {
        !self.from_me && !self.is_group && !self.has_user
    }

    fn unrouted(&self) -> bool {
        self.automatable() && !self.has_queue
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Rating,
    Integration,
    ChannelPrompt,
    ChannelIntegration,
    QueueSelection,
    AutoAssignQueue,
    QueueMenu,
    Greeting,
    MenuWalk,
    None,
}

struct Rule {
    route: Route,
    applies: fn(&RouteFacts) -> bool,
}

const RULES: &[Rule] = &[
    Rule {
        route: Route::Rating,
        applies: |f| !f.from_me && f.awaiting_rating && f.numeric_body,
    },
    Rule {
        route: Route::Integration,
        applies: |f| f.automatable() && f.integration_active,
    },
    Rule {
        route: Route::ChannelPrompt,
        applies: |f| f.unrouted() && f.channel_prompt,
    },
    Rule {
        route: Route::ChannelIntegration,
        applies: |f| f.unrouted() && f.channel_integration && !f.bot_limited,
    },
    Rule {
        route: Route::QueueSelection,
        applies: |f| {
            f.unrouted()
                && f.awaiting_queue_selection
                && f.numeric_body
                && f.queue_count > 1
        },
    },
    Rule {
        route: Route::AutoAssignQueue,
        applies: |f| f.unrouted() && f.queue_count == 1 && !f.bot_limited,
    },
    Rule {
        route: Route::QueueMenu,
        applies: |f| f.unrouted() && f.queue_count > 1 && !f.bot_limited,
    },
    Rule {
        route: Route::Greeting,
        applies: |f| f.unrouted() && f.queue_count == 0,
    },
    Rule {
        route: Route::MenuWalk,
        applies: |f| f.automatable() && f.has_queue && f.chatbot && !f.bot_limited,
    },
];

pub fn decide(facts: &RouteFacts) -> Route {
    RULES
        .iter()
        .find(|rule| (rule.applies)(facts))
        .map(|rule| rule.route)
        .unwrap_or(Route::None)
}

/// Usage cap or cooldown keeps the queue bot quiet.
pub fn bot_limited(
    channel: &Channel,
    ticket: &Ticket,
    chatbot_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    let capped = channel.max_use_bot_queues != 0
        && ticket.amount_used_bot_queues >= channel.max_use_bot_queues;
    let cooling = channel.time_use_bot_queues != 0
        && ticket.amount_used_bot_queues != 0
        && chatbot_at
            .is_some_and(|at| at + Duration::minutes(channel.time_use_bot_queues) > now);
    capped || cooling
}

/// One inbound message on its way through routing.
pub(crate) struct Turn<'a> {
    pub session: &'a Arc<Session>,
    pub channel: &'a Channel,
    pub contact: &'a Contact,
    pub raw: &'a RawMessage,
    pub kind: &'a MessageKind,
    pub body: &'a str,
    pub media: Option<&'a StoredMedia>,
    pub settings: &'a TenantSettings,
    pub queues: &'a [Queue],
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

impl Engine {
    pub(crate) async fn execute_route(
        &self,
        route: Route,
        turn: &Turn<'_>,
        ticket: Ticket,
        tracking: &TicketTracking,
    ) -> Result<()> {
        debug!(ticket_id = ticket.id, ?route, "Routing message");
        match route {
            Route::Rating | Route::None => Ok(()),
            Route::Integration => {
                self.guarded(&ticket, "ticket_integration", self.run_ticket_integration(turn, &ticket))
                    .await;
                Ok(())
            }
            Route::ChannelPrompt => {
                let Some(prompt_id) = turn.channel.prompt_id else {
                    return Ok(());
                };
                let Some(prompt) = self.store.get_prompt(prompt_id).await? else {
                    warn!(prompt_id, "Channel prompt no longer exists");
                    return Ok(());
                };
                self.guarded(&ticket, "channel_prompt", self.handle_ai(turn, &ticket, &prompt))
                    .await;
                Ok(())
            }
            Route::ChannelIntegration => {
                let Some(integration_id) = turn.channel.integration_id else {
                    return Ok(());
                };
                let Some(integration) = self.store.get_integration(integration_id).await? else {
                    warn!(integration_id, "Channel integration no longer exists");
                    return Ok(());
                };
                let ticket = self
                    .patch_ticket(
                        &ticket,
                        TicketChanges {
                            use_integration: Some(true),
                            integration_id: Some(Some(integration.id)),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.guarded(
                    &ticket,
                    "channel_integration",
                    self.handle_integration(turn, &ticket, &integration),
                )
                .await;
                Ok(())
            }
            Route::QueueSelection => {
                let choice: usize = turn.body.trim().parse().unwrap_or_default();
                match choice.checked_sub(1).and_then(|i| turn.queues.get(i)) {
                    Some(queue) => self.choose_queue(turn, &ticket, queue).await?,
                    None => self.send_queue_menu(turn, &ticket).await?,
                }
                self.mark_chatbot_at(tracking, false).await
            }
            Route::AutoAssignQueue => {
                if let Some(queue) = turn.queues.first() {
                    self.choose_queue(turn, &ticket, queue).await?;
                }
                self.mark_chatbot_at(tracking, false).await
            }
            Route::QueueMenu => {
                self.send_queue_menu(turn, &ticket).await?;
                self.mark_chatbot_at(tracking, true).await
            }
            Route::Greeting => self.send_greeting(turn, &ticket).await,
            Route::MenuWalk => self.handle_menu_walk(turn, &ticket).await,
        }
    }

    /// Integration and AI failures never escape routing: they are counted,
    /// logged and reported, and the customer simply gets no bot reply.
    async fn guarded(&self, ticket: &Ticket, context: &str, fut: impl Future<Output = Result<()>>) {
        if let Err(e) = fut.await {
            self.metrics.inc_integration_failures();
            warn!(ticket_id = ticket.id, context, error = %e, "Automated reply failed");
            report_exception(
                context,
                Some(ticket.tenant_id),
                json!({ "ticketId": ticket.id, "error": e.to_string() }),
            );
        }
    }

    async fn mark_chatbot_at(&self, tracking: &TicketTracking, refresh: bool) -> Result<()> {
        if tracking.chatbot_at.is_some() && !refresh {
            return Ok(());
        }
        self.store
            .update_tracking(
                tracking,
                &TrackingChanges {
                    chatbot_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn send_queue_menu(&self, turn: &Turn<'_>, ticket: &Ticket) -> Result<()> {
        let greeting = turn.channel.greeting_message.as_deref().unwrap_or_default();
        let body = queue_menu_text(greeting, turn.queues);
        let (_, ticket) = self.send_text(turn.session, ticket, turn.contact, &body).await?;
        self.patch_ticket(
            &ticket,
            TicketChanges {
                awaiting_queue_selection: Some(true),
                amount_used_bot_queues: Some(ticket.amount_used_bot_queues + 1),
                ..Default::default()
            },
        )
        .await?;
        Ok(())
    }

    /// Put the ticket in `queue` and start whatever automation it carries.
    pub(crate) async fn choose_queue(&self, turn: &Turn<'_>, ticket: &Ticket, queue: &Queue) -> Result<()> {
        let options = self.store.list_queue_options(queue.id, None).await?;
        let automated = queue.integration_id.is_some() || queue.prompt_id.is_some();
        let outcome = self
            .update_ticket(
                ticket.id,
                crate::tickets::TicketUpdate {
                    queue_id: Some(Some(queue.id)),
                    chatbot: Some(!options.is_empty() || automated),
                    ..Default::default()
                },
            )
            .await?;
        let ticket = outcome.ticket;

        if !options.is_empty() {
            return self.render_menu(turn, &ticket, queue, None).await;
        }

        let now = Local::now().naive_local();
        if let Some(ooh) = non_empty(queue.out_of_hours_message.as_deref()) {
            if todays_entry(&queue.schedules, now).is_some() && !is_within_hours(&queue.schedules, now) {
                let body = format!("\u{200e} {ooh}\n\n*[ # ]* - Voltar ao Menu Principal");
                let (_, ticket) = self.send_text(turn.session, &ticket, turn.contact, &body).await?;
                self.patch_ticket(
                    &ticket,
                    TicketChanges {
                        queue_id: Some(None),
                        chatbot: Some(false),
                        ..Default::default()
                    },
                )
                .await?;
                return Ok(());
            }
        }

        let greeting = non_empty(queue.greeting_message.as_deref());
        let mut ticket = ticket;
        if automated {
            ticket = self
                .patch_ticket(
                    &ticket,
                    TicketChanges {
                        use_integration: Some(true),
                        integration_id: Some(queue.integration_id),
                        prompt_id: Some(queue.prompt_id),
                        ..Default::default()
                    },
                )
                .await?;
            if greeting.is_none() {
                self.guarded(&ticket, "queue_integration", self.run_ticket_integration(turn, &ticket))
                    .await;
            }
        }

        if let Some(greeting) = greeting {
            self.send_text(turn.session, &ticket, turn.contact, greeting).await?;
        }
        Ok(())
    }

    async fn send_greeting(&self, turn: &Turn<'_>, ticket: &Ticket) -> Result<()> {
        let Some(greeting) = non_empty(turn.channel.greeting_message.as_deref()) else {
            return Ok(());
        };
        let rendered = format_body(greeting, turn.contact);
        if let Some(last) = self.store.latest_ticket_message(ticket.id, true).await? {
            if last.body.contains(&rendered) {
                debug!(ticket_id = ticket.id, "Greeting already sent");
                return Ok(());
            }
        }

        let engine = self.clone();
        let ticket_id = ticket.id;
        let body = greeting.to_string();
        self.debouncer.debounce(
            format!("ticket:{ticket_id}"),
            std::time::Duration::from_millis(self.config.pipeline.greeting_debounce_ms),
            move || async move { engine.send_text_later(ticket_id, body).await },
        );
        Ok(())
    }

    /// Continue with the AI prompt or integration the ticket is bound to.
    async fn run_ticket_integration(&self, turn: &Turn<'_>, ticket: &Ticket) -> Result<()> {
        if let Some(prompt_id) = ticket.prompt_id {
            if let Some(prompt) = self.store.get_prompt(prompt_id).await? {
                return self.handle_ai(turn, ticket, &prompt).await;
            }
        }
        if let Some(integration_id) = ticket.integration_id {
            if let Some(integration) = self.store.get_integration(integration_id).await? {
                return self.handle_integration(turn, ticket, &integration).await;
            }
        }
        Ok(())
    }
}
