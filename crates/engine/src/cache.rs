use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Small string key/value cache; unread counters live here.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String);
}

#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: String) {
        self.entries.write().await.insert(key.to_string(), value);
    }
}

pub fn unread_key(contact_id: i64) -> String {
    format!("contacts:{contact_id}:unreads")
}
