use super::Turn;
use crate::normalizer::MessageKind;
use crate::registry::Session;
use crate::tickets::TicketUpdate;
use crate::Engine;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use regex::Regex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use zapdesk_core::audit::report_exception;
use zapdesk_core::transport::OutboundContent;
use zapdesk_core::types::{
    Contact, Integration, IntegrationKind, Prompt, Ticket, TicketChanges, TicketStatus,
};
use zapdesk_providers::intent::encode_audio;
use zapdesk_providers::{ChatMessage, ChatRole, GenerationOptions, IntentQuery};

const TRANSFER_ACTION: &str = "Ação: Transferir para o setor de atendimento";
const DEFAULT_LANGUAGE: &str = "pt-BR";

static CONVERSATION_FINISHED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)atendimento finalizado").unwrap());

fn system_prompt(first_name: &str, prompt: &Prompt) -> String {
    format!(
        "Nas respostas utilize o nome {first_name} para identificar o cliente.\n\
         Sua resposta deve usar no máximo {} tokens e cuide para não truncar o final.\n\
         Sempre que possível, mencione o nome dele para ser mais personalizado o atendimento e mais educado. \
         Quando a resposta requer uma transferência para o setor de atendimento, comece sua resposta com '{TRANSFER_ACTION}'.\n\n\
         {}\n",
        prompt.max_tokens, prompt.prompt
    )
}

/// Split the hand-off marker from the reply the customer should see.
pub(crate) fn take_transfer(reply: &str) -> (bool, String) {
    match reply.find(TRANSFER_ACTION) {
        Some(at) => {
            let rest = format!("{}{}", &reply[..at], &reply[at + TRANSFER_ACTION.len()..]);
            (true, rest.trim().to_string())
        }
        None => (false, reply.trim().to_string()),
    }
}

/// What the intent engine is asked, captured before the debounce delay.
struct IntentTurn {
    session: Arc<Session>,
    ticket: Ticket,
    contact: Contact,
    integration: Integration,
    text: String,
    audio: Option<PathBuf>,
}

impl Engine {
    /// Answer the customer with the prompt's model, by text or voice.
    pub(crate) async fn handle_ai(&self, turn: &Turn<'_>, ticket: &Ticket, prompt: &Prompt) -> Result<()> {
        let provider = self.providers.for_api_key(&prompt.api_key)?;

        let question = match turn.kind {
            MessageKind::Audio => {
                let Some(media) = turn.media else {
                    debug!(ticket_id = ticket.id, "Audio without stored media; skipping AI");
                    return Ok(());
                };
                let audio = tokio::fs::read(&media.path)
                    .await
                    .with_context(|| format!("Failed to read {}", media.path.display()))?;
                provider
                    .transcribe(audio, &media.file_name, &self.config.ai.transcription_model)
                    .await?
            }
            kind if kind.is_typed_text() => turn.body.to_string(),
            _ => return Ok(()),
        };

        let current_id = turn.raw.external_id();
        let texty = [
            MessageKind::Conversation.as_str(),
            MessageKind::ExtendedText.as_str(),
        ];
        let mut messages = vec![ChatMessage::new(
            ChatRole::System,
            system_prompt(&turn.contact.first_name(), prompt),
        )];
        for past in self
            .store
            .ticket_history(ticket.id, prompt.max_messages.max(1))
            .await?
            .into_iter()
            .filter(|m| m.id != current_id && texty.contains(&m.media_type.as_str()))
        {
            let role = if past.from_me { ChatRole::Assistant } else { ChatRole::User };
            messages.push(ChatMessage::new(role, past.body));
        }
        messages.push(ChatMessage::new(ChatRole::User, question));

        let options = GenerationOptions {
            model: self.config.ai.chat_model.clone(),
            max_tokens: usize::try_from(prompt.max_tokens).ok(),
            temperature: Some(prompt.temperature),
        };
        let response = provider.chat(&messages, &options).await?;
        let (transfer, reply) = take_transfer(&response.content);

        let mut ticket = ticket.clone();
        if transfer {
            info!(ticket_id = ticket.id, queue_id = ?prompt.queue_id, "AI handed the ticket to a human queue");
            ticket = self
                .update_ticket(
                    ticket.id,
                    TicketUpdate {
                        queue_id: Some(prompt.queue_id),
                        use_integration: Some(false),
                        prompt_id: Some(None),
                        ..Default::default()
                    },
                )
                .await?
                .ticket;
        }
        if reply.is_empty() {
            return Ok(());
        }

        if prompt.replies_with_text() {
            self.send_text(turn.session, &ticket, turn.contact, &reply).await?;
            return Ok(());
        }

        let speech = provider
            .synthesize(&reply, &prompt.voice, &self.config.ai.speech_model)
            .await?;
        let dir = self.config.attachments.tenant_directory(ticket.tenant_id);
        tokio::fs::create_dir_all(&dir).await?;
        let file_name = format!("{}.mp3", Utc::now().timestamp_millis());
        let path = dir.join(&file_name);
        tokio::fs::write(&path, &speech).await?;
        let stored = crate::media::StoredMedia {
            file_name,
            path: path.clone(),
            mimetype: "audio/mpeg".to_string(),
        };
        let content = OutboundContent::Audio {
            url: path.to_string_lossy().into_owned(),
            mimetype: stored.mimetype.clone(),
            ptt: true,
        };
        self.send_content(turn.session, &ticket, turn.contact, content, Some(&stored))
            .await?;
        Ok(())
    }

    pub(crate) async fn handle_integration(
        &self,
        turn: &Turn<'_>,
        ticket: &Ticket,
        integration: &Integration,
    ) -> Result<()> {
        match integration.kind {
            IntegrationKind::Webhook | IntegrationKind::Flow => {
                let url = integration
                    .url
                    .clone()
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| anyhow!("integration {} has no url", integration.id))?;
                let payload = json!({
                    "message": turn.raw,
                    "ticketId": ticket.id,
                    "channelId": ticket.channel_id,
                    "tenantId": ticket.tenant_id,
                    "contact": turn.contact,
                });
                let flow = self.flow.clone();
                let metrics = self.metrics.clone();
                let ticket_id = ticket.id;
                let tenant_id = ticket.tenant_id;
                tokio::spawn(async move {
                    if let Err(e) = flow.deliver(&url, &payload).await {
                        metrics.inc_integration_failures();
                        warn!(ticket_id, url = %url, error = %e, "Webhook delivery failed");
                        report_exception(
                            "webhook_delivery",
                            Some(tenant_id),
                            json!({ "ticketId": ticket_id, "error": e.to_string() }),
                        );
                    }
                });
                Ok(())
            }
            IntegrationKind::IntentEngine => {
                let ticket = self
                    .patch_ticket(
                        ticket,
                        TicketChanges {
                            chatbot: Some(true),
                            ..Default::default()
                        },
                    )
                    .await?;
                let text = match turn.kind {
                    MessageKind::Image | MessageKind::Document | MessageKind::DocumentWithCaption => {
                        "imagem".to_string()
                    }
                    _ => turn.body.to_string(),
                };
                let audio = match turn.kind {
                    MessageKind::Audio => turn.media.map(|m| m.path.clone()),
                    _ => None,
                };
                let pending = IntentTurn {
                    session: turn.session.clone(),
                    ticket,
                    contact: turn.contact.clone(),
                    integration: integration.clone(),
                    text,
                    audio,
                };

                let engine = self.clone();
                self.debouncer.debounce(
                    format!("intent:{}", pending.ticket.id),
                    Duration::from_millis(self.config.pipeline.intent_debounce_ms),
                    move || async move {
                        let ticket = pending.ticket.clone();
                        engine
                            .guarded(&ticket, "intent_engine", engine.run_intent(pending))
                            .await;
                    },
                );
                Ok(())
            }
        }
    }

    async fn run_intent(&self, turn: IntentTurn) -> Result<()> {
        let IntentTurn {
            session,
            ticket,
            contact,
            integration,
            text,
            audio,
        } = turn;
        let endpoint = integration
            .url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| anyhow!("integration {} has no url", integration.id))?;
        let audio = match audio {
            Some(path) => Some(encode_audio(&tokio::fs::read(&path).await?)),
            None => None,
        };
        let query = IntentQuery {
            session: contact.number.clone(),
            project_name: integration.project_name.clone().unwrap_or_default(),
            text,
            language_code: integration
                .language
                .clone()
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            audio,
        };
        let result = self.intent.query(&endpoint, &query).await?;
        let mut ticket = self.store.get_ticket(ticket.id).await?.unwrap_or(ticket);
        let name = &integration.name;

        if result.responses.is_empty() {
            self.send_text(
                &session,
                &ticket,
                &contact,
                &format!("*{name}:*\nNão consegui entender sua dúvida."),
            )
            .await?;
            return Ok(());
        }

        if result.end_conversation {
            ticket = self
                .patch_ticket(
                    &ticket,
                    TicketChanges {
                        integration_id: Some(None),
                        use_integration: Some(false),
                        chatbot: Some(false),
                        ..Default::default()
                    },
                )
                .await?;
        }

        for response in result.responses.iter().filter(|r| !r.text.trim().is_empty()) {
            let (_, sent) = self
                .send_text(&session, &ticket, &contact, &format!("*{name}:*\n{}", response.text))
                .await?;
            ticket = sent;
            if CONVERSATION_FINISHED.is_match(&response.text) {
                info!(ticket_id = ticket.id, "Intent engine finished the conversation");
                ticket = self
                    .update_ticket(
                        ticket.id,
                        TicketUpdate {
                            status: Some(TicketStatus::Closed),
                            ..Default::default()
                        },
                    )
                    .await?
                    .ticket;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, settle, text_message, Fixture, CUSTOMER};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use zapdesk_persistence::{NewPrompt, NewQueue};
    use zapdesk_providers::factory::ProviderFactory;
    use zapdesk_providers::{
        FlowClient, GenerationResponse, IntentEngine, IntentResponseText, IntentResult,
        LLMProvider, ProviderError,
    };

    struct ScriptedModel {
        reply: String,
        seen: Mutex<Vec<ChatMessage>>,
    }

    #[async_trait]
    impl LLMProvider for ScriptedModel {
        async fn chat(
            &self,
            messages: &[ChatMessage],
            _options: &GenerationOptions,
        ) -> Result<GenerationResponse, ProviderError> {
            *self.seen.lock().unwrap() = messages.to_vec();
            Ok(GenerationResponse {
                content: self.reply.clone(),
                usage: None,
            })
        }
    }

    struct Fixed(Arc<ScriptedModel>);

    impl ProviderFactory for Fixed {
        fn for_api_key(&self, _api_key: &str) -> Result<Arc<dyn LLMProvider>> {
            Ok(self.0.clone())
        }
    }

    /// Channel with a single queue answered by an AI prompt that hands off
    /// to an unattached "Humanos" queue.
    async fn with_ai_queue(reply: &str) -> (Fixture, Arc<ScriptedModel>, i64) {
        let mut fx = fixture().await;
        let model = Arc::new(ScriptedModel {
            reply: reply.to_string(),
            seen: Mutex::new(vec![]),
        });
        fx.engine = fx.engine.clone().with_providers(Arc::new(Fixed(model.clone())));
        let store = &fx.engine.store;
        let humans = store
            .create_queue(&NewQueue {
                tenant_id: fx.tenant.id,
                name: "Humanos".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let prompt = store
            .create_prompt(&NewPrompt {
                tenant_id: fx.tenant.id,
                name: "Assistente".to_string(),
                prompt: "Você atende uma pizzaria.".to_string(),
                api_key: "sk-test".to_string(),
                max_tokens: 100,
                max_messages: 10,
                temperature: 0.5,
                voice: "texto".to_string(),
                queue_id: Some(humans.id),
            })
            .await
            .unwrap();
        let queue = store
            .create_queue(&NewQueue {
                tenant_id: fx.tenant.id,
                name: "IA".to_string(),
                prompt_id: Some(prompt.id),
                ..Default::default()
            })
            .await
            .unwrap();
        store.attach_queue(fx.channel.id, queue.id).await.unwrap();
        (fx, model, humans.id)
    }

    #[test]
    fn test_transfer_marker_is_stripped() {
        assert_eq!(
            take_transfer("Ação: Transferir para o setor de atendimento\nUm instante."),
            (true, "Um instante.".to_string())
        );
        assert_eq!(take_transfer(" Olá! "), (false, "Olá!".to_string()));
    }

    #[tokio::test]
    async fn test_prompt_answers_with_text() {
        let (fx, model, _) = with_ai_queue("Abrimos às 18h.").await;

        fx.deliver(text_message("IN1", CUSTOMER, "Que horas abre?")).await;

        assert_eq!(fx.transport.sent_texts(), vec!["\u{200e}Abrimos às 18h.".to_string()]);
        let seen = model.seen.lock().unwrap().clone();
        assert_eq!(seen[0].role, ChatRole::System);
        assert!(seen[0].content.contains("utilize o nome Maria"));
        assert_eq!(seen.last().unwrap().content, "Que horas abre?");
        assert_eq!(seen.len(), 2);
        let ticket = fx.customer_ticket().await;
        assert!(ticket.use_integration);
        assert!(ticket.prompt_id.is_some());
    }

    struct Unavailable;

    #[async_trait]
    impl LLMProvider for Unavailable {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _options: &GenerationOptions,
        ) -> Result<GenerationResponse, ProviderError> {
            Err(ProviderError::NetworkError("connection refused".to_string()))
        }
    }

    impl ProviderFactory for Unavailable {
        fn for_api_key(&self, _api_key: &str) -> Result<Arc<dyn LLMProvider>> {
            Err(anyhow!("no client for key"))
        }
    }

    struct DownModel;

    impl ProviderFactory for DownModel {
        fn for_api_key(&self, _api_key: &str) -> Result<Arc<dyn LLMProvider>> {
            Ok(Arc::new(Unavailable))
        }
    }

    async fn assert_failure_swallowed(fx: &Fixture, failures_before: u64) {
        assert_eq!(fx.engine.metrics().snapshot().integration_failures, failures_before + 1);
        assert!(fx.transport.sent().is_empty());
        assert!(fx.engine.store.message_exists("IN1", fx.tenant.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_provider_failures_send_nothing() {
        let factories: [Arc<dyn ProviderFactory>; 2] = [Arc::new(Unavailable), Arc::new(DownModel)];
        for factory in factories {
            let (mut fx, _, _) = with_ai_queue("nunca enviado").await;
            fx.engine = fx.engine.clone().with_providers(factory);
            let before = fx.engine.metrics().snapshot().integration_failures;

            fx.deliver(text_message("IN1", CUSTOMER, "Que horas abre?")).await;

            assert_failure_swallowed(&fx, before).await;
        }
    }

    #[tokio::test]
    async fn test_prompt_hands_off_to_queue() {
        let (fx, _, humans) =
            with_ai_queue("Ação: Transferir para o setor de atendimento\nVou te transferir.").await;

        fx.deliver(text_message("IN1", CUSTOMER, "Quero falar com alguém")).await;

        let ticket = fx.customer_ticket().await;
        assert_eq!(ticket.queue_id, Some(humans));
        assert!(!ticket.use_integration);
        assert_eq!(ticket.prompt_id, None);
        assert_eq!(fx.transport.sent_texts(), vec!["\u{200e}Vou te transferir.".to_string()]);
    }

    struct RecordingFlow(Mutex<Vec<(String, serde_json::Value)>>);

    #[async_trait]
    impl FlowClient for RecordingFlow {
        async fn deliver(
            &self,
            url: &str,
            payload: &serde_json::Value,
        ) -> Result<serde_json::Value, ProviderError> {
            self.0.lock().unwrap().push((url.to_string(), payload.clone()));
            Ok(serde_json::Value::Null)
        }
    }

    struct CannedIntent(IntentResult);

    #[async_trait]
    impl IntentEngine for CannedIntent {
        async fn query(&self, _endpoint: &str, _query: &IntentQuery) -> Result<IntentResult, ProviderError> {
            Ok(self.0.clone())
        }
    }

    struct Refusing;

    #[async_trait]
    impl IntentEngine for Refusing {
        async fn query(&self, _endpoint: &str, _query: &IntentQuery) -> Result<IntentResult, ProviderError> {
            Err(ProviderError::ApiError("HTTP 503".to_string()))
        }
    }

    #[async_trait]
    impl FlowClient for Refusing {
        async fn deliver(
            &self,
            _url: &str,
            _payload: &serde_json::Value,
        ) -> Result<serde_json::Value, ProviderError> {
            Err(ProviderError::ApiError("HTTP 503".to_string()))
        }
    }

    async fn channel_integration(fx: &Fixture, kind: IntegrationKind) -> Integration {
        fx.engine
            .store
            .create_integration(fx.tenant.id, "Bot", kind, Some("http://flow.local/hook"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_webhook_receives_raw_message() {
        let mut fx = fixture().await;
        let flow = Arc::new(RecordingFlow(Mutex::new(vec![])));
        fx.engine = fx.engine.clone().with_flow_client(flow.clone());
        let integration = channel_integration(&fx, IntegrationKind::Webhook).await;
        let contact = fx.contact("5511999990000").await;
        let ticket = fx.ticket(&contact).await;
        let ticket = fx
            .engine
            .patch_ticket(
                &ticket,
                TicketChanges {
                    use_integration: Some(true),
                    integration_id: Some(Some(integration.id)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        fx.deliver(text_message("IN1", CUSTOMER, "pedido 42")).await;
        settle().await;

        let delivered = flow.0.lock().unwrap().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "http://flow.local/hook");
        assert_eq!(delivered[0].1["ticketId"], ticket.id);
        assert_eq!(delivered[0].1["message"]["message"]["conversation"], "pedido 42");
    }

    #[tokio::test]
    async fn test_intent_replies_and_finishes() {
        let mut fx = fixture().await;
        fx.engine = fx.engine.clone().with_intent_engine(Arc::new(CannedIntent(IntentResult {
            responses: vec![IntentResponseText {
                text: "Atendimento finalizado, obrigado!".to_string(),
            }],
            ..Default::default()
        })));
        let integration = channel_integration(&fx, IntegrationKind::IntentEngine).await;
        let contact = fx.contact("5511999990000").await;
        let ticket = fx.ticket(&contact).await;
        fx.engine
            .patch_ticket(
                &ticket,
                TicketChanges {
                    use_integration: Some(true),
                    integration_id: Some(Some(integration.id)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        fx.deliver(text_message("IN1", CUSTOMER, "tchau")).await;
        settle().await;

        assert_eq!(
            fx.transport.sent_texts(),
            vec!["\u{200e}*Bot:*\nAtendimento finalizado, obrigado!".to_string()]
        );
        assert_eq!(fx.customer_ticket().await.status, TicketStatus::Closed);
    }

    #[tokio::test]
    async fn test_intent_without_answer_apologizes() {
        let mut fx = fixture().await;
        fx.engine = fx
            .engine
            .clone()
            .with_intent_engine(Arc::new(CannedIntent(IntentResult::default())));
        let integration = channel_integration(&fx, IntegrationKind::IntentEngine).await;
        let contact = fx.contact("5511999990000").await;
        let ticket = fx.ticket(&contact).await;
        fx.engine
            .patch_ticket(
                &ticket,
                TicketChanges {
                    use_integration: Some(true),
                    integration_id: Some(Some(integration.id)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        fx.deliver(text_message("IN1", CUSTOMER, "???")).await;
        fx.deliver(text_message("IN2", CUSTOMER, "alô")).await;
        settle().await;

        assert_eq!(
            fx.transport.sent_texts(),
            vec!["\u{200e}*Bot:*\nNão consegui entender sua dúvida.".to_string()]
        );
    }

    #[tokio::test]
    async fn test_integration_failures_send_nothing() {
        for kind in [IntegrationKind::IntentEngine, IntegrationKind::Webhook] {
            let mut fx = fixture().await;
            fx.engine = fx
                .engine
                .clone()
                .with_intent_engine(Arc::new(Refusing))
                .with_flow_client(Arc::new(Refusing));
            let integration = channel_integration(&fx, kind).await;
            let contact = fx.contact("5511999990000").await;
            let ticket = fx.ticket(&contact).await;
            fx.engine
                .patch_ticket(
                    &ticket,
                    TicketChanges {
                        use_integration: Some(true),
                        integration_id: Some(Some(integration.id)),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            let before = fx.engine.metrics().snapshot().integration_failures;

            fx.deliver(text_message("IN1", CUSTOMER, "pedido 42")).await;
            settle().await;

            assert_failure_swallowed(&fx, before).await;
        }
    }
}
