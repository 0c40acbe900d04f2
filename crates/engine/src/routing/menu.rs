//! Queue and option menus, in the display style the tenant configured.

use super::Turn;
use crate::send::mark_automated;
use crate::settings::ChatbotDisplay;
use crate::template::format_body;
use crate::Engine;
use anyhow::Result;
use tracing::debug;
use zapdesk_core::transport::{OutboundButton, OutboundContent, OutboundRow};
use zapdesk_core::types::{Queue, QueueOption, Ticket, TicketChanges};

const MAX_BUTTONS: usize = 4;
const LIST_BUTTON_TEXT: &str = "Escolha uma opção";
const HOME_LINE: &str = "*[ # ]* - Menu inicial";
const BACK_LINE: &str = "*[ 0 ]* - Menu anterior";

pub fn queue_menu_text(greeting: &str, queues: &[Queue]) -> String {
    let mut body = String::new();
    if !greeting.trim().is_empty() {
        body.push_str(greeting);
        body.push_str("\n\n");
    }
    for (i, queue) in queues.iter().enumerate() {
        body.push_str(&format!("*[ {} ]* - {}\n", i + 1, queue.name));
    }
    body
}

fn footer(at_root: bool) -> String {
    if at_root {
        format!("\n{HOME_LINE}")
    } else {
        format!("\n{BACK_LINE}\n{HOME_LINE}")
    }
}

fn text_menu(header: &str, options: &[QueueOption], at_root: bool) -> OutboundContent {
    let mut body = String::new();
    if !header.is_empty() {
        body.push_str(header);
        body.push_str("\n\n");
    }
    for opt in options {
        body.push_str(&format!("*[ {} ]* - {}\n", opt.option, opt.title));
    }
    body.push_str(&footer(at_root));
    OutboundContent::text(body)
}

/// Render the options under the current cursor.
pub fn option_menu(
    display: ChatbotDisplay,
    header: &str,
    options: &[QueueOption],
    at_root: bool,
) -> OutboundContent {
    match display {
        ChatbotDisplay::Button if options.len() <= MAX_BUTTONS => {
            let mut buttons: Vec<OutboundButton> = options
                .iter()
                .map(|opt| OutboundButton {
                    id: opt.option.clone(),
                    display_text: opt.title.clone(),
                })
                .collect();
            buttons.push(OutboundButton {
                id: "#".to_string(),
                display_text: "Menu inicial *[ 0 ]* Menu anterior".to_string(),
            });
            OutboundContent::Buttons {
                text: header.to_string(),
                buttons,
            }
        }
        ChatbotDisplay::List => {
            let mut rows: Vec<OutboundRow> = options
                .iter()
                .map(|opt| OutboundRow {
                    id: opt.option.clone(),
                    title: opt.title.clone(),
                })
                .collect();
            rows.push(OutboundRow {
                id: "#".to_string(),
                title: "Menu inicial".to_string(),
            });
            OutboundContent::List {
                text: header.to_string(),
                button_text: LIST_BUTTON_TEXT.to_string(),
                rows,
            }
        }
        _ => text_menu(header, options, at_root),
    }
}

enum Step {
    Render(Option<QueueOption>),
    Unmatched,
}

impl Engine {
    /// Show the menu at `cursor` (the queue root when `None`), or the
    /// final answer when the cursor has no children.
    pub(crate) async fn render_menu(
        &self,
        turn: &Turn<'_>,
        ticket: &Ticket,
        queue: &Queue,
        cursor: Option<&QueueOption>,
    ) -> Result<()> {
        let options = self
            .store
            .list_queue_options(queue.id, cursor.map(|c| c.id))
            .await?;

        if let (Some(leaf), true) = (cursor, options.is_empty()) {
            let answer = leaf.message.as_deref().unwrap_or(&leaf.title);
            let body = format!("{answer}\n{}", footer(false));
            let (_, ticket) = self.send_text(turn.session, ticket, turn.contact, &body).await?;
            if queue.integration_id.is_some() || queue.prompt_id.is_some() {
                self.patch_ticket(
                    &ticket,
                    TicketChanges {
                        use_integration: Some(true),
                        integration_id: Some(queue.integration_id),
                        prompt_id: Some(queue.prompt_id),
                        chatbot: Some(false),
                        ..Default::default()
                    },
                )
                .await?;
            }
            return Ok(());
        }

        let header = match cursor {
            Some(c) => c.message.clone().unwrap_or_else(|| c.title.clone()),
            None => queue.greeting_message.clone().unwrap_or_default(),
        };
        let header = mark_automated(&format_body(&header, turn.contact));
        let content = option_menu(turn.settings.chatbot_display, &header, &options, cursor.is_none());
        self.send_content(turn.session, ticket, turn.contact, content, None)
            .await?;
        Ok(())
    }

    /// Move the option cursor according to the customer's answer.
    pub(crate) async fn handle_menu_walk(&self, turn: &Turn<'_>, ticket: &Ticket) -> Result<()> {
        let Some(queue_id) = ticket.queue_id else {
            return Ok(());
        };
        let Some(queue) = self.store.get_queue(queue_id).await? else {
            return Ok(());
        };
        let answer = turn.body.trim();

        if answer == "#" {
            let ticket = self
                .patch_ticket(
                    ticket,
                    TicketChanges {
                        queue_id: Some(None),
                        queue_option_id: Some(None),
                        chatbot: Some(false),
                        awaiting_queue_selection: Some(false),
                        ..Default::default()
                    },
                )
                .await?;
            return match turn.queues {
                [only] => self.choose_queue(turn, &ticket, only).await,
                [] => Ok(()),
                _ => self.send_queue_menu(turn, &ticket).await,
            };
        }

        let cursor = match ticket.queue_option_id {
            Some(id) => self.store.get_queue_option(id).await?,
            None => None,
        };
        let step = match &cursor {
            Some(current) if answer == "0" => match current.parent_id {
                Some(parent) => Step::Render(self.store.get_queue_option(parent).await?),
                None => Step::Render(None),
            },
            Some(current) => {
                let mut children = self.store.list_queue_options(queue.id, Some(current.id)).await?;
                if children.len() == 1 {
                    Step::Render(children.pop())
                } else {
                    children
                        .into_iter()
                        .find(|c| c.option == answer)
                        .map_or(Step::Unmatched, |c| Step::Render(Some(c)))
                }
            }
            None => self
                .store
                .list_queue_options(queue.id, None)
                .await?
                .into_iter()
                .find(|c| c.option == answer)
                .map_or(Step::Unmatched, |c| Step::Render(Some(c))),
        };

        let next = match step {
            Step::Render(next) => next,
            Step::Unmatched => {
                debug!(ticket_id = ticket.id, answer, "Answer matches no option");
                return self.render_menu(turn, ticket, &queue, cursor.as_ref()).await;
            }
        };
        let ticket = self
            .patch_ticket(
                ticket,
                TicketChanges {
                    queue_option_id: Some(next.as_ref().map(|n| n.id)),
                    ..Default::default()
                },
            )
            .await?;
        self.render_menu(turn, &ticket, &queue, next.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, text_message, CUSTOMER};

    fn opt(id: i64, code: &str, title: &str) -> QueueOption {
        QueueOption {
            id,
            queue_id: 1,
            parent_id: None,
            option: code.to_string(),
            title: title.to_string(),
            message: None,
        }
    }

    #[test]
    fn test_text_menu_footers() {
        let options = [opt(1, "1", "Financeiro"), opt(2, "2", "Vendas")];
        let root = option_menu(ChatbotDisplay::Text, "Olá", &options, true);
        assert_eq!(
            root.preview(),
            "Olá\n\n*[ 1 ]* - Financeiro\n*[ 2 ]* - Vendas\n\n*[ # ]* - Menu inicial"
        );
        let nested = option_menu(ChatbotDisplay::Text, "", &options[..1], false);
        assert_eq!(
            nested.preview(),
            "*[ 1 ]* - Financeiro\n\n*[ 0 ]* - Menu anterior\n*[ # ]* - Menu inicial"
        );
    }

    #[test]
    fn test_buttons_fall_back_to_text_when_crowded() {
        let few = [opt(1, "1", "A"), opt(2, "2", "B")];
        match option_menu(ChatbotDisplay::Button, "h", &few, true) {
            OutboundContent::Buttons { buttons, .. } => {
                assert_eq!(buttons.len(), 3);
                assert_eq!(buttons[2].id, "#");
            }
            other => panic!("expected buttons, got {other:?}"),
        }
        let many: Vec<_> = (1..=5).map(|i| opt(i, &i.to_string(), "x")).collect();
        assert!(matches!(
            option_menu(ChatbotDisplay::Button, "h", &many, true),
            OutboundContent::Text { .. }
        ));
    }

    #[test]
    fn test_list_menu_adds_home_row() {
        let options = [opt(1, "1", "Suporte")];
        match option_menu(ChatbotDisplay::List, "h", &options, true) {
            OutboundContent::List { button_text, rows, .. } => {
                assert_eq!(button_text, LIST_BUTTON_TEXT);
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0].title, "Suporte");
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn test_queue_menu_text() {
        let queue = |name: &str| Queue {
            id: 1,
            tenant_id: 1,
            name: name.to_string(),
            greeting_message: None,
            out_of_hours_message: None,
            schedules: vec![],
            integration_id: None,
            prompt_id: None,
        };
        assert_eq!(
            queue_menu_text("Bem-vindo", &[queue("Vendas"), queue("Suporte")]),
            "Bem-vindo\n\n*[ 1 ]* - Vendas\n*[ 2 ]* - Suporte\n"
        );
    }

    #[tokio::test]
    async fn test_walks_option_tree() {
        let fx = fixture().await;
        let queue = fx.add_queue("Atendimento").await;
        let store = &fx.engine.store;
        let finance = store
            .create_queue_option(queue.id, None, "1", "Financeiro", None)
            .await
            .unwrap();
        store
            .create_queue_option(queue.id, None, "2", "Vendas", None)
            .await
            .unwrap();
        let billing = store
            .create_queue_option(queue.id, Some(finance.id), "1", "Boletos", Some("Segue o boleto"))
            .await
            .unwrap();

        fx.deliver(text_message("IN1", CUSTOMER, "oi")).await;
        let ticket = fx.customer_ticket().await;
        assert_eq!(ticket.queue_id, Some(queue.id));
        assert!(ticket.chatbot);
        assert!(fx.transport.sent_texts()[0].contains("*[ 1 ]* - Financeiro\n*[ 2 ]* - Vendas\n"));

        fx.deliver(text_message("IN2", CUSTOMER, "1")).await;
        assert_eq!(fx.customer_ticket().await.queue_option_id, Some(finance.id));
        assert!(fx.transport.sent_texts()[1].contains("*[ 1 ]* - Boletos"));

        fx.deliver(text_message("IN3", CUSTOMER, "1")).await;
        assert_eq!(fx.customer_ticket().await.queue_option_id, Some(billing.id));
        assert!(fx.transport.sent_texts()[2].starts_with("\u{200e}Segue o boleto"));

        fx.deliver(text_message("IN4", CUSTOMER, "0")).await;
        assert_eq!(fx.customer_ticket().await.queue_option_id, Some(finance.id));

        fx.deliver(text_message("IN5", CUSTOMER, "#")).await;
        let ticket = fx.customer_ticket().await;
        assert_eq!(ticket.queue_id, Some(queue.id));
        assert_eq!(ticket.queue_option_id, None);
        assert_eq!(fx.transport.sent_texts().len(), 5);
    }
}
