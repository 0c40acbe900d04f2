use crate::{rows, SqliteStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use zapdesk_core::types::{
    Ticket, TicketChanges, TicketStatus, TicketTracking, TrackingChanges, UserRating,
};

impl SqliteStore {
    #[instrument(skip(self))]
    pub async fn get_ticket(&self, id: i64) -> Result<Option<Ticket>> {
        let row = sqlx::query("SELECT * FROM tickets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load ticket")?;
        row.map(|r| rows::ticket(&r)).transpose().map_err(Into::into)
    }

    /// Most recently touched ticket of the contact on this channel, any status.
    #[instrument(skip(self))]
    pub async fn find_latest_ticket(
        &self,
        tenant_id: i64,
        contact_id: i64,
        channel_id: i64,
    ) -> Result<Option<Ticket>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM tickets
            WHERE tenant_id = ? AND contact_id = ? AND channel_id = ?
              AND status IN ('open', 'pending', 'closed')
            ORDER BY updated_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(contact_id)
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to find ticket")?;
        row.map(|r| rows::ticket(&r)).transpose().map_err(Into::into)
    }

    /// Open or pending tickets of the contact outside `except_ticket_id` on other channels.
    #[instrument(skip(self))]
    pub async fn find_active_tickets_elsewhere(
        &self,
        contact_id: i64,
        channel_id: i64,
        except_ticket_id: i64,
    ) -> Result<Vec<Ticket>> {
        let found = sqlx::query(
            r#"
            SELECT * FROM tickets
            WHERE contact_id = ? AND channel_id != ? AND id != ?
              AND status IN ('open', 'pending')
            "#,
        )
        .bind(contact_id)
        .bind(channel_id)
        .bind(except_ticket_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to find active tickets")?;
        found
            .iter()
            .map(rows::ticket)
            .collect::<sqlx::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    #[instrument(skip(self))]
    pub async fn create_ticket(
        &self,
        tenant_id: i64,
        contact_id: i64,
        channel_id: i64,
        is_group: bool,
        unread_messages: i64,
    ) -> Result<Ticket> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO tickets
                (tenant_id, contact_id, channel_id, status, is_group, unread_messages, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(contact_id)
        .bind(channel_id)
        .bind(is_group)
        .bind(unread_messages)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert ticket")?;
        Ok(rows::ticket(&row)?)
    }

    /// Write `changes` on top of `current` only if the row still carries
    /// `current.version`. Returns `None` when another writer got there first.
    #[instrument(skip(self, current, changes), fields(ticket_id = current.id, version = current.version))]
    pub async fn compare_and_swap_ticket(
        &self,
        current: &Ticket,
        changes: &TicketChanges,
    ) -> Result<Option<Ticket>> {
        let mut next = current.clone();
        changes.apply(&mut next);

        let row = sqlx::query(
            r#"
            UPDATE tickets
            SET status = ?, user_id = ?, queue_id = ?, queue_option_id = ?, chatbot = ?,
                use_integration = ?, integration_id = ?, prompt_id = ?, amount_used_bot_queues = ?,
                last_message = ?, from_me = ?, unread_messages = ?, awaiting_queue_selection = ?,
                version = version + 1, updated_at = ?
            WHERE id = ? AND version = ?
            RETURNING *
            "#,
        )
        .bind(next.status.as_str())
        .bind(next.user_id)
        .bind(next.queue_id)
        .bind(next.queue_option_id)
        .bind(next.chatbot)
        .bind(next.use_integration)
        .bind(next.integration_id)
        .bind(next.prompt_id)
        .bind(next.amount_used_bot_queues)
        .bind(&next.last_message)
        .bind(next.from_me)
        .bind(next.unread_messages)
        .bind(next.awaiting_queue_selection)
        .bind(Utc::now())
        .bind(current.id)
        .bind(current.version)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to update ticket")?;

        if row.is_none() {
            debug!("Ticket version moved, update rejected");
        }
        row.map(|r| rows::ticket(&r)).transpose().map_err(Into::into)
    }

    /// Open tickets on the channel idle since `cutoff` whose last word was ours.
    #[instrument(skip(self))]
    pub async fn list_idle_open_tickets(
        &self,
        channel_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Ticket>> {
        let found = sqlx::query(
            r#"
            SELECT * FROM tickets
            WHERE channel_id = ? AND status = ? AND is_group = 0 AND from_me = 1
              AND updated_at < ?
            "#,
        )
        .bind(channel_id)
        .bind(TicketStatus::Open.as_str())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list idle tickets")?;
        found
            .iter()
            .map(rows::ticket)
            .collect::<sqlx::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    /// Unfinished tracking row of the ticket, if any.
    #[instrument(skip(self))]
    pub async fn find_open_tracking(&self, ticket_id: i64) -> Result<Option<TicketTracking>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM ticket_trackings
            WHERE ticket_id = ? AND finished_at IS NULL
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(ticket_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to find tracking")?;
        row.map(|r| rows::tracking(&r)).transpose().map_err(Into::into)
    }

    #[instrument(skip(self))]
    pub async fn latest_tracking(&self, ticket_id: i64) -> Result<Option<TicketTracking>> {
        let row = sqlx::query(
            "SELECT * FROM ticket_trackings WHERE ticket_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(ticket_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load tracking")?;
        row.map(|r| rows::tracking(&r)).transpose().map_err(Into::into)
    }

    #[instrument(skip(self))]
    pub async fn create_tracking(
        &self,
        ticket_id: i64,
        tenant_id: i64,
        channel_id: Option<i64>,
        user_id: Option<i64>,
    ) -> Result<TicketTracking> {
        let row = sqlx::query(
            r#"
            INSERT INTO ticket_trackings (ticket_id, tenant_id, channel_id, user_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(ticket_id)
        .bind(tenant_id)
        .bind(channel_id)
        .bind(user_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert tracking")?;
        Ok(rows::tracking(&row)?)
    }

    #[instrument(skip(self, tracking, changes), fields(tracking_id = tracking.id))]
    pub async fn update_tracking(
        &self,
        tracking: &TicketTracking,
        changes: &TrackingChanges,
    ) -> Result<TicketTracking> {
        let mut next = tracking.clone();
        changes.apply(&mut next);

        let row = sqlx::query(
            r#"
            UPDATE ticket_trackings
            SET user_id = ?, queued_at = ?, started_at = ?, chatbot_at = ?, rating_at = ?,
                finished_at = ?, closed_at = ?, rated = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(next.user_id)
        .bind(next.queued_at)
        .bind(next.started_at)
        .bind(next.chatbot_at)
        .bind(next.rating_at)
        .bind(next.finished_at)
        .bind(next.closed_at)
        .bind(next.rated)
        .bind(tracking.id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to update tracking")?;
        Ok(rows::tracking(&row)?)
    }

    #[instrument(skip(self))]
    pub async fn create_user_rating(
        &self,
        ticket_id: i64,
        tenant_id: i64,
        user_id: Option<i64>,
        rate: i64,
    ) -> Result<UserRating> {
        let row = sqlx::query(
            r#"
            INSERT INTO user_ratings (ticket_id, tenant_id, user_id, rate, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(ticket_id)
        .bind(tenant_id)
        .bind(user_id)
        .bind(rate)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert rating")?;
        Ok(rows::user_rating(&row)?)
    }

    #[instrument(skip(self))]
    pub async fn list_ratings(&self, ticket_id: i64) -> Result<Vec<UserRating>> {
        let found = sqlx::query("SELECT * FROM user_ratings WHERE ticket_id = ? ORDER BY id")
            .bind(ticket_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list ratings")?;
        found
            .iter()
            .map(rows::user_rating)
            .collect::<sqlx::Result<Vec<_>>>()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewChannel;
    use zapdesk_core::types::NewContact;

    async fn seeded() -> (SqliteStore, Ticket) {
        let store = SqliteStore::in_memory().await.unwrap();
        let tenant = store.create_tenant("Acme", &[]).await.unwrap();
        let channel = store
            .create_channel(&NewChannel {
                tenant_id: tenant.id,
                name: "Main".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let contact = store
            .create_contact(&NewContact {
                tenant_id: tenant.id,
                name: "Maria".to_string(),
                number: "5511999990000".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let ticket = store
            .create_ticket(tenant.id, contact.id, channel.id, false, 1)
            .await
            .unwrap();
        (store, ticket)
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let (store, ticket) = seeded().await;
        assert_eq!(ticket.status, TicketStatus::Pending);

        let open = TicketChanges {
            status: Some(TicketStatus::Open),
            ..Default::default()
        };
        let updated = store.compare_and_swap_ticket(&ticket, &open).await.unwrap().unwrap();
        assert_eq!(updated.version, ticket.version + 1);
        assert_eq!(updated.status, TicketStatus::Open);

        let close = TicketChanges {
            status: Some(TicketStatus::Closed),
            ..Default::default()
        };
        assert!(store.compare_and_swap_ticket(&ticket, &close).await.unwrap().is_none());
        let reloaded = store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, TicketStatus::Open);
    }

    #[tokio::test]
    async fn test_open_tracking_ignores_finished_rows() {
        let (store, ticket) = seeded().await;
        let first = store
            .create_tracking(ticket.id, ticket.tenant_id, Some(ticket.channel_id), None)
            .await
            .unwrap();
        store
            .update_tracking(
                &first,
                &TrackingChanges {
                    finished_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(store.find_open_tracking(ticket.id).await.unwrap().is_none());

        let second = store
            .create_tracking(ticket.id, ticket.tenant_id, Some(ticket.channel_id), None)
            .await
            .unwrap();
        let open = store.find_open_tracking(ticket.id).await.unwrap().unwrap();
        assert_eq!(open.id, second.id);
    }
}
