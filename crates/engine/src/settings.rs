use anyhow::Result;
use zapdesk_persistence::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatbotDisplay {
    Text,
    Button,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleScope {
    Disabled,
    Company,
    Queue,
}

/// Per-tenant switches the pipeline consults on every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantSettings {
    pub chatbot_display: ChatbotDisplay,
    pub schedule_scope: ScheduleScope,
    pub user_rating: bool,
    pub transfer_notifications: bool,
    pub block_groups: bool,
    pub calls_enabled: bool,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            chatbot_display: ChatbotDisplay::Text,
            schedule_scope: ScheduleScope::Disabled,
            user_rating: false,
            transfer_notifications: false,
            block_groups: false,
            calls_enabled: true,
        }
    }
}

fn enabled(value: Option<&str>) -> bool {
    value == Some("enabled")
}

impl TenantSettings {
    pub async fn load(store: &SqliteStore, tenant_id: i64) -> Result<Self> {
        let get = move |key: &'static str| store.get_setting(tenant_id, key);

        let chatbot_display = match get("chatBotType").await?.as_deref() {
            Some("button") => ChatbotDisplay::Button,
            Some("list") => ChatbotDisplay::List,
            _ => ChatbotDisplay::Text,
        };
        let schedule_scope = match get("scheduleType").await?.as_deref() {
            Some("company") => ScheduleScope::Company,
            Some("queue") => ScheduleScope::Queue,
            _ => ScheduleScope::Disabled,
        };

        Ok(Self {
            chatbot_display,
            schedule_scope,
            user_rating: enabled(get("userRating").await?.as_deref()),
            transfer_notifications: enabled(get("sendMsgTransfTicket").await?.as_deref()),
            block_groups: enabled(get("CheckMsgIsGroup").await?.as_deref()),
            calls_enabled: get("call").await?.as_deref() != Some("disabled"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_defaults_and_overrides() {
        let store = SqliteStore::in_memory().await.unwrap();
        let tenant = store.create_tenant("Acme", &[]).await.unwrap();
        assert_eq!(
            TenantSettings::load(&store, tenant.id).await.unwrap(),
            TenantSettings::default()
        );

        store.set_setting(tenant.id, "chatBotType", "list").await.unwrap();
        store.set_setting(tenant.id, "scheduleType", "queue").await.unwrap();
        store.set_setting(tenant.id, "userRating", "enabled").await.unwrap();
        store.set_setting(tenant.id, "call", "disabled").await.unwrap();

        let settings = TenantSettings::load(&store, tenant.id).await.unwrap();
        assert_eq!(settings.chatbot_display, ChatbotDisplay::List);
        assert_eq!(settings.schedule_scope, ScheduleScope::Queue);
        assert!(settings.user_rating);
        assert!(!settings.calls_enabled);
        assert!(!settings.block_groups);
    }
}
