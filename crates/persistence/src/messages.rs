use crate::{rows, SqliteStore};
use anyhow::{Context, Result};
use chrono::Utc;
use tracing::instrument;
use zapdesk_core::types::{Message, NewMessage};

impl SqliteStore {
    /// Dedup probe on the (external id, tenant) key.
    #[instrument(skip(self))]
    pub async fn message_exists(&self, id: &str, tenant_id: i64) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM messages WHERE id = ? AND tenant_id = ? LIMIT 1")
                .bind(id)
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to probe message")?;
        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    pub async fn get_message(&self, id: &str, tenant_id: i64) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ? AND tenant_id = ?")
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load message")?;
        row.map(|r| rows::message(&r)).transpose().map_err(Into::into)
    }

    /// Insert, or refresh body/media/edit state when the id is already known.
    #[instrument(skip(self, msg), fields(message_id = %msg.id, ticket_id = msg.ticket_id))]
    pub async fn upsert_message(&self, msg: &NewMessage) -> Result<Message> {
        let row = sqlx::query(
            r#"
            INSERT INTO messages
                (id, tenant_id, ticket_id, contact_id, body, from_me, read, media_url, media_type,
                 quoted_msg_id, ack, remote_jid, participant, data_json, is_edited, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id, tenant_id) DO UPDATE SET
                body = excluded.body,
                media_url = COALESCE(excluded.media_url, messages.media_url),
                is_edited = excluded.is_edited,
                data_json = excluded.data_json
            RETURNING *
            "#,
        )
        .bind(&msg.id)
        .bind(msg.tenant_id)
        .bind(msg.ticket_id)
        .bind(msg.contact_id)
        .bind(&msg.body)
        .bind(msg.from_me)
        .bind(msg.read)
        .bind(&msg.media_url)
        .bind(&msg.media_type)
        .bind(&msg.quoted_msg_id)
        .bind(msg.ack)
        .bind(&msg.remote_jid)
        .bind(&msg.participant)
        .bind(&msg.data_json)
        .bind(msg.is_edited)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert message")?;
        Ok(rows::message(&row)?)
    }

    /// Returns `None` when the message is not stored (yet).
    #[instrument(skip(self))]
    pub async fn update_message_ack(
        &self,
        id: &str,
        tenant_id: i64,
        ack: i64,
    ) -> Result<Option<Message>> {
        let row = sqlx::query(
            "UPDATE messages SET ack = ? WHERE id = ? AND tenant_id = ? RETURNING *",
        )
        .bind(ack)
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to update ack")?;
        row.map(|r| rows::message(&r)).transpose().map_err(Into::into)
    }

    #[instrument(skip(self))]
    pub async fn mark_message_edited(
        &self,
        id: &str,
        tenant_id: i64,
        body: &str,
    ) -> Result<Option<Message>> {
        let row = sqlx::query(
            "UPDATE messages SET body = ?, is_edited = 1 WHERE id = ? AND tenant_id = ? RETURNING *",
        )
        .bind(body)
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to edit message")?;
        row.map(|r| rows::message(&r)).transpose().map_err(Into::into)
    }

    /// Newest message the contact sent, across all of their tickets.
    #[instrument(skip(self))]
    pub async fn latest_contact_message(
        &self,
        tenant_id: i64,
        contact_id: i64,
    ) -> Result<Option<Message>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE tenant_id = ? AND contact_id = ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(contact_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load contact message")?;
        row.map(|r| rows::message(&r)).transpose().map_err(Into::into)
    }

    #[instrument(skip(self))]
    pub async fn latest_ticket_message(
        &self,
        ticket_id: i64,
        from_me: bool,
    ) -> Result<Option<Message>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE ticket_id = ? AND from_me = ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(ticket_id)
        .bind(from_me)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load ticket message")?;
        row.map(|r| rows::message(&r)).transpose().map_err(Into::into)
    }

    /// Last `limit` messages of the ticket, oldest first.
    #[instrument(skip(self))]
    pub async fn ticket_history(&self, ticket_id: i64, limit: i64) -> Result<Vec<Message>> {
        let found = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT * FROM messages
                WHERE ticket_id = ?
                ORDER BY created_at DESC
                LIMIT ?
            ) ORDER BY created_at ASC
            "#,
        )
        .bind(ticket_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch history")?;
        found
            .iter()
            .map(rows::message)
            .collect::<sqlx::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    #[instrument(skip(self))]
    pub async fn count_messages(&self, tenant_id: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count messages")?;
        Ok(count)
    }
}
