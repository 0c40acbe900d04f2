//! Delivery and read receipts for stored messages.

use crate::registry::Session;
use crate::Engine;
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};
use zapdesk_core::bus::message_event;
use zapdesk_core::protocol::{MessageKey, MessageUpdate};

impl Engine {
    /// Apply each receipt as its own task, at most `ack_concurrency` at a time.
    /// Receipts for messages we never stored are dropped.
    pub async fn apply_acks(&self, session: &Arc<Session>, updates: Vec<MessageUpdate>) {
        let tasks = updates.into_iter().filter_map(|update| {
            let id = update.key.id.clone().filter(|id| !id.is_empty())?;
            let ack = update.update.status?;
            let engine = self.clone();
            let tenant_id = session.tenant_id;
            Some(tokio::spawn(async move {
                let Ok(_permit) = engine.ack_permits.clone().acquire_owned().await else {
                    return;
                };
                engine.apply_ack(tenant_id, &id, ack).await;
            }))
        });
        join_all(tasks).await;
    }

    async fn apply_ack(&self, tenant_id: i64, id: &str, ack: i64) {
        match self.store.update_message_ack(id, tenant_id, ack).await {
            Ok(Some(message)) => {
                self.metrics.inc_acks();
                self.bus.emit_to_room(
                    &message.ticket_id.to_string(),
                    &message_event(tenant_id),
                    json!({ "action": "update", "message": message }),
                );
            }
            Ok(None) => debug!(message_id = id, ack, "Receipt for unknown message skipped"),
            Err(e) => warn!(message_id = id, error = %e, "Failed to apply receipt"),
        }
    }

    /// Send read receipts for an inbound message without holding up the pipeline.
    pub(crate) fn mark_read(&self, session: &Arc<Session>, key: MessageKey) {
        let transport = session.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.read_messages(&[key]).await {
                debug!(error = %e, "Read receipt failed");
            }
        });
    }
}
