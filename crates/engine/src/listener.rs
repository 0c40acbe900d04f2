//! Per-channel ingestion loop over the session's transport events.

use crate::identity::{jid_digits, store_mapping};
use crate::normalizer::is_processable;
use crate::registry::Session;
use crate::Engine;
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zapdesk_core::audit::report_exception;
use zapdesk_core::bus::{contact_event, ROOM_NOTIFICATION};
use zapdesk_core::protocol::{LidMapping, RawMessage, TransportEvent};

impl Engine {
    /// Consume the session's events until it is deregistered.
    pub fn start_listening(&self, session: Arc<Session>) -> JoinHandle<()> {
        let engine = self.clone();
        let mut events = session.subscribe();
        tokio::spawn(async move {
            info!(channel_id = session.channel_id, "Listening for transport events");
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let engine = engine.clone();
                        let session = session.clone();
                        tokio::spawn(async move { engine.dispatch(&session, event).await });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(channel_id = session.channel_id, skipped, "Event listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            info!(channel_id = session.channel_id, "Transport event stream closed");
        })
    }

    /// Handle one transport event. Failures are logged per message and never
    /// escape, so one bad event cannot stop the loop.
    pub async fn dispatch(&self, session: &Arc<Session>, event: TransportEvent) {
        match event {
            TransportEvent::MessagesUpsert(upsert) => {
                let tasks = upsert
                    .messages
                    .into_iter()
                    .filter(is_processable)
                    .map(|raw| {
                        let engine = self.clone();
                        let session = session.clone();
                        tokio::spawn(async move { engine.ingest(&session, raw).await })
                    });
                join_all(tasks).await;
            }
            TransportEvent::MessagesUpdate(updates) => self.apply_acks(session, updates).await,
            TransportEvent::LidMappingUpdate(mapping) => self.apply_lid_mapping(session, mapping).await,
            TransportEvent::Call(calls) => {
                if let Err(e) = self.handle_calls(session, calls).await {
                    error!(channel_id = session.channel_id, error = %e, "Call handling failed");
                }
            }
        }
    }

    async fn ingest(&self, session: &Arc<Session>, raw: RawMessage) {
        let id = raw.external_id().to_string();
        match self.store.message_exists(&id, session.tenant_id).await {
            Ok(true) => {
                self.metrics.inc_duplicates();
                debug!(message_id = %id, "Duplicate delivery skipped");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!(message_id = %id, error = %e, "Duplicate check failed");
                return;
            }
        }

        if let Err(e) = self.handle_message(session, &raw).await {
            error!(message_id = %id, error = %e, "Failed to handle message");
            report_exception(
                "handle_message",
                Some(session.tenant_id),
                json!({ "messageId": id, "error": e.to_string() }),
            );
        }
    }

    async fn apply_lid_mapping(&self, session: &Arc<Session>, mapping: LidMapping) {
        let LidMapping { lid, pn } = mapping;
        self.identity.remember(&lid, &pn);
        store_mapping(session.transport.clone(), lid.clone(), pn.clone());

        let digits = jid_digits(&pn);
        match self
            .store
            .apply_lid_mapping(session.tenant_id, &digits, &lid, &digits)
            .await
        {
            Ok(updated) => {
                for contact in updated {
                    self.bus.emit_to_rooms(
                        [ROOM_NOTIFICATION],
                        &contact_event(session.tenant_id),
                        json!({ "action": "update", "contact": contact }),
                    );
                }
            }
            Err(e) => warn!(lid = %lid, error = %e, "Failed to backfill lid mapping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{fixture, text_message, CUSTOMER};
    use std::time::Duration;
    use zapdesk_core::protocol::{LidMapping, MessagesUpsert, TransportEvent};
    use zapdesk_core::transport::LidMappingStore;

    #[tokio::test]
    async fn test_redelivered_message_is_handled_once() {
        let fx = fixture().await;
        fx.add_queue("Queue A").await;
        fx.add_queue("Queue B").await;

        fx.deliver(text_message("DUP1", CUSTOMER, "oi")).await;
        fx.deliver(text_message("DUP1", CUSTOMER, "oi")).await;

        assert_eq!(fx.engine.store.count_messages(fx.tenant.id).await.unwrap(), 2);
        assert_eq!(fx.transport.sent().len(), 1);
        assert_eq!(fx.engine.metrics.snapshot().duplicates_skipped, 1);
    }

    #[tokio::test]
    async fn test_status_broadcasts_are_filtered() {
        let fx = fixture().await;
        fx.deliver(text_message("S1", "status@broadcast", "story")).await;
        assert_eq!(fx.engine.store.count_contacts(fx.tenant.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lid_mapping_backfills_contact() {
        let fx = fixture().await;
        let contact = fx.contact("5511999990000").await;

        fx.engine
            .dispatch(
                &fx.session,
                TransportEvent::LidMappingUpdate(LidMapping {
                    lid: "98765@lid".to_string(),
                    pn: CUSTOMER.to_string(),
                }),
            )
            .await;

        let updated = fx.engine.store.get_contact(contact.id).await.unwrap().unwrap();
        assert_eq!(updated.lid.as_deref(), Some("98765@lid"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let pn = fx.transport.pn_for_lid("98765@lid").await.unwrap();
        assert_eq!(pn.as_deref(), Some(CUSTOMER));
    }

    #[tokio::test]
    async fn test_loop_consumes_published_events() {
        let fx = fixture().await;
        let handle = fx.engine.start_listening(fx.session.clone());

        fx.session.publish(TransportEvent::MessagesUpsert(MessagesUpsert {
            messages: vec![text_message("L1", CUSTOMER, "pelo loop")],
            kind: Some("notify".to_string()),
        }));
        for _ in 0..50 {
            if fx.engine.store.count_messages(fx.tenant.id).await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fx.engine.store.count_messages(fx.tenant.id).await.unwrap(), 1);
        handle.abort();
    }
}
