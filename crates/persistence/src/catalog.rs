use crate::{rows, SqliteStore};
use anyhow::{Context, Result};
use tracing::instrument;
use zapdesk_core::types::{
    Channel, Integration, IntegrationKind, Prompt, Queue, QueueOption, ScheduleEntry, Tenant, User,
};

#[derive(Debug, Clone, Default)]
pub struct NewChannel {
    pub tenant_id: i64,
    pub name: String,
    pub greeting_message: Option<String>,
    pub completion_message: Option<String>,
    pub out_of_hours_message: Option<String>,
    pub rating_message: Option<String>,
    pub transfer_message: Option<String>,
    pub prompt_id: Option<i64>,
    pub integration_id: Option<i64>,
    pub max_use_bot_queues: i64,
    pub time_use_bot_queues: i64,
    pub expires_ticket: i64,
    pub expires_inactive_message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewQueue {
    pub tenant_id: i64,
    pub name: String,
    pub greeting_message: Option<String>,
    pub out_of_hours_message: Option<String>,
    pub schedules: Vec<ScheduleEntry>,
    pub integration_id: Option<i64>,
    pub prompt_id: Option<i64>,
    pub order_queue: i64,
}

#[derive(Debug, Clone)]
pub struct NewPrompt {
    pub tenant_id: i64,
    pub name: String,
    pub prompt: String,
    pub api_key: String,
    pub max_tokens: i64,
    pub max_messages: i64,
    pub temperature: f64,
    pub voice: String,
    pub queue_id: Option<i64>,
}

impl SqliteStore {
    #[instrument(skip(self, schedules))]
    pub async fn create_tenant(&self, name: &str, schedules: &[ScheduleEntry]) -> Result<Tenant> {
        let row = sqlx::query("INSERT INTO tenants (name, schedules) VALUES (?, ?) RETURNING *")
            .bind(name)
            .bind(serde_json::to_string(schedules)?)
            .fetch_one(&self.pool)
            .await
            .context("Failed to insert tenant")?;
        Ok(rows::tenant(&row)?)
    }

    #[instrument(skip(self))]
    pub async fn get_tenant(&self, id: i64) -> Result<Option<Tenant>> {
        let row = sqlx::query("SELECT * FROM tenants WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load tenant")?;
        row.map(|r| rows::tenant(&r)).transpose().map_err(Into::into)
    }

    #[instrument(skip(self, schedules))]
    pub async fn set_tenant_schedules(&self, id: i64, schedules: &[ScheduleEntry]) -> Result<()> {
        sqlx::query("UPDATE tenants SET schedules = ? WHERE id = ?")
            .bind(serde_json::to_string(schedules)?)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update tenant schedules")?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_setting(&self, tenant_id: i64, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM settings WHERE tenant_id = ? AND setting_key = ?")
                .bind(tenant_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to read setting")?;
        Ok(row.map(|r| r.0))
    }

    #[instrument(skip(self))]
    pub async fn set_setting(&self, tenant_id: i64, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (tenant_id, setting_key, value) VALUES (?, ?, ?)
            ON CONFLICT (tenant_id, setting_key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(tenant_id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("Failed to write setting")?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn create_user(&self, tenant_id: i64, name: &str) -> Result<User> {
        let row = sqlx::query("INSERT INTO users (tenant_id, name) VALUES (?, ?) RETURNING *")
            .bind(tenant_id)
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .context("Failed to insert user")?;
        Ok(rows::user(&row)?)
    }

    #[instrument(skip(self))]
    pub async fn get_user(&self, id: i64) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load user")?;
        row.map(|r| rows::user(&r)).transpose().map_err(Into::into)
    }

    #[instrument(skip(self, channel))]
    pub async fn create_channel(&self, channel: &NewChannel) -> Result<Channel> {
        let row = sqlx::query(
            r#"
            INSERT INTO channels
                (tenant_id, name, greeting_message, completion_message, out_of_hours_message,
                 rating_message, transfer_message, prompt_id, integration_id, max_use_bot_queues,
                 time_use_bot_queues, expires_ticket, expires_inactive_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(channel.tenant_id)
        .bind(&channel.name)
        .bind(&channel.greeting_message)
        .bind(&channel.completion_message)
        .bind(&channel.out_of_hours_message)
        .bind(&channel.rating_message)
        .bind(&channel.transfer_message)
        .bind(channel.prompt_id)
        .bind(channel.integration_id)
        .bind(channel.max_use_bot_queues)
        .bind(channel.time_use_bot_queues)
        .bind(channel.expires_ticket)
        .bind(&channel.expires_inactive_message)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert channel")?;
        Ok(rows::channel(&row)?)
    }

    #[instrument(skip(self))]
    pub async fn get_channel(&self, id: i64) -> Result<Option<Channel>> {
        let row = sqlx::query("SELECT * FROM channels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load channel")?;
        row.map(|r| rows::channel(&r)).transpose().map_err(Into::into)
    }

    #[instrument(skip(self))]
    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        let found = sqlx::query("SELECT * FROM channels ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list channels")?;
        found
            .iter()
            .map(rows::channel)
            .collect::<sqlx::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    #[instrument(skip(self, queue))]
    pub async fn create_queue(&self, queue: &NewQueue) -> Result<Queue> {
        let row = sqlx::query(
            r#"
            INSERT INTO queues
                (tenant_id, name, greeting_message, out_of_hours_message, schedules,
                 integration_id, prompt_id, order_queue)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(queue.tenant_id)
        .bind(&queue.name)
        .bind(&queue.greeting_message)
        .bind(&queue.out_of_hours_message)
        .bind(serde_json::to_string(&queue.schedules)?)
        .bind(queue.integration_id)
        .bind(queue.prompt_id)
        .bind(queue.order_queue)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert queue")?;
        Ok(rows::queue(&row)?)
    }

    #[instrument(skip(self))]
    pub async fn attach_queue(&self, channel_id: i64, queue_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO channel_queues (channel_id, queue_id) VALUES (?, ?)")
            .bind(channel_id)
            .bind(queue_id)
            .execute(&self.pool)
            .await
            .context("Failed to attach queue")?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_queue(&self, id: i64) -> Result<Option<Queue>> {
        let row = sqlx::query("SELECT * FROM queues WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load queue")?;
        row.map(|r| rows::queue(&r)).transpose().map_err(Into::into)
    }

    /// Queues bound to a channel in menu order.
    #[instrument(skip(self))]
    pub async fn list_channel_queues(&self, channel_id: i64) -> Result<Vec<Queue>> {
        let found = sqlx::query(
            r#"
            SELECT q.* FROM queues q
            JOIN channel_queues cq ON cq.queue_id = q.id
            WHERE cq.channel_id = ?
            ORDER BY q.order_queue ASC, q.id ASC
            "#,
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list channel queues")?;
        found
            .iter()
            .map(rows::queue)
            .collect::<sqlx::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    #[instrument(skip(self))]
    pub async fn create_queue_option(
        &self,
        queue_id: i64,
        parent_id: Option<i64>,
        option: &str,
        title: &str,
        message: Option<&str>,
    ) -> Result<QueueOption> {
        let row = sqlx::query(
            r#"
            INSERT INTO queue_options (queue_id, parent_id, option_code, title, message)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(queue_id)
        .bind(parent_id)
        .bind(option)
        .bind(title)
        .bind(message)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert queue option")?;
        Ok(rows::queue_option(&row)?)
    }

    #[instrument(skip(self))]
    pub async fn get_queue_option(&self, id: i64) -> Result<Option<QueueOption>> {
        let row = sqlx::query("SELECT * FROM queue_options WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load queue option")?;
        row.map(|r| rows::queue_option(&r)).transpose().map_err(Into::into)
    }

    /// Children of `parent_id`, or the root level of the queue when `None`.
    #[instrument(skip(self))]
    pub async fn list_queue_options(
        &self,
        queue_id: i64,
        parent_id: Option<i64>,
    ) -> Result<Vec<QueueOption>> {
        let found = sqlx::query(
            r#"
            SELECT * FROM queue_options
            WHERE queue_id = ? AND parent_id IS ?
            ORDER BY CAST(option_code AS INTEGER) ASC, option_code ASC
            "#,
        )
        .bind(queue_id)
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list queue options")?;
        found
            .iter()
            .map(rows::queue_option)
            .collect::<sqlx::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    #[instrument(skip(self, prompt))]
    pub async fn create_prompt(&self, prompt: &NewPrompt) -> Result<Prompt> {
        let row = sqlx::query(
            r#"
            INSERT INTO prompts
                (tenant_id, name, prompt, api_key, max_tokens, max_messages, temperature, voice, queue_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(prompt.tenant_id)
        .bind(&prompt.name)
        .bind(&prompt.prompt)
        .bind(&prompt.api_key)
        .bind(prompt.max_tokens)
        .bind(prompt.max_messages)
        .bind(prompt.temperature)
        .bind(&prompt.voice)
        .bind(prompt.queue_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert prompt")?;
        Ok(rows::prompt(&row)?)
    }

    #[instrument(skip(self))]
    pub async fn get_prompt(&self, id: i64) -> Result<Option<Prompt>> {
        let row = sqlx::query("SELECT * FROM prompts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load prompt")?;
        row.map(|r| rows::prompt(&r)).transpose().map_err(Into::into)
    }

    #[instrument(skip(self))]
    pub async fn create_integration(
        &self,
        tenant_id: i64,
        name: &str,
        kind: IntegrationKind,
        url: Option<&str>,
    ) -> Result<Integration> {
        let row = sqlx::query(
            "INSERT INTO integrations (tenant_id, name, kind, url) VALUES (?, ?, ?, ?) RETURNING *",
        )
        .bind(tenant_id)
        .bind(name)
        .bind(kind.as_str())
        .bind(url)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert integration")?;
        Ok(rows::integration(&row)?)
    }

    #[instrument(skip(self))]
    pub async fn get_integration(&self, id: i64) -> Result<Option<Integration>> {
        let row = sqlx::query("SELECT * FROM integrations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load integration")?;
        row.map(|r| rows::integration(&r)).transpose().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_options_are_scoped_by_parent() {
        let store = SqliteStore::in_memory().await.unwrap();
        let tenant = store.create_tenant("Acme", &[]).await.unwrap();
        let queue = store
            .create_queue(&NewQueue {
                tenant_id: tenant.id,
                name: "Suporte".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let root = store
            .create_queue_option(queue.id, None, "1", "Boletos", None)
            .await
            .unwrap();
        store
            .create_queue_option(queue.id, None, "2", "Entregas", None)
            .await
            .unwrap();
        store
            .create_queue_option(queue.id, Some(root.id), "1", "Segunda via", Some("Enviamos"))
            .await
            .unwrap();

        let roots = store.list_queue_options(queue.id, None).await.unwrap();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].title, "Boletos");

        let children = store.list_queue_options(queue.id, Some(root.id)).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].parent_id, Some(root.id));
    }

    #[tokio::test]
    async fn test_settings_upsert() {
        let store = SqliteStore::in_memory().await.unwrap();
        let tenant = store.create_tenant("Acme", &[]).await.unwrap();
        assert_eq!(store.get_setting(tenant.id, "userRating").await.unwrap(), None);

        store.set_setting(tenant.id, "userRating", "disabled").await.unwrap();
        store.set_setting(tenant.id, "userRating", "enabled").await.unwrap();
        assert_eq!(
            store.get_setting(tenant.id, "userRating").await.unwrap().as_deref(),
            Some("enabled")
        );
    }

    #[tokio::test]
    async fn test_channel_queues_follow_menu_order() {
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

        for (name, order) in [("B", 2), ("A", 1)] {
            let queue = store
                .create_queue(&NewQueue {
                    tenant_id: tenant.id,
                    name: name.to_string(),
                    order_queue: order,
                    ..Default::default()
                })
                .await
                .unwrap();
            store.attach_queue(channel.id, queue.id).await.unwrap();
        }

        let queues = store.list_channel_queues(channel.id).await.unwrap();
        let names: Vec<_> = queues.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }
}
