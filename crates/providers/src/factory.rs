use crate::openai::OpenAIProvider;
use crate::reliable::ReliableProvider;
use crate::LLMProvider;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use zapdesk_core::config::AiConfig;

/// Hands out a provider per API key; each AI prompt carries its own key.
pub trait ProviderFactory: Send + Sync {
    fn for_api_key(&self, api_key: &str) -> anyhow::Result<Arc<dyn LLMProvider>>;
}

/// Builds OpenAI-compatible clients once per key and reuses them.
pub struct CachedProviderFactory {
    api_base: String,
    cache: Mutex<HashMap<String, Arc<dyn LLMProvider>>>,
}

impl CachedProviderFactory {
    pub fn new(config: &AiConfig) -> Self {
        Self {
            api_base: config.api_base.clone(),
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl ProviderFactory for CachedProviderFactory {
    fn for_api_key(&self, api_key: &str) -> anyhow::Result<Arc<dyn LLMProvider>> {
        if api_key.trim().is_empty() {
            anyhow::bail!("AI prompt has no API key configured");
        }

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow::anyhow!("provider cache poisoned"))?;
        let provider = cache
            .entry(api_key.to_string())
            .or_insert_with(|| {
                let p = Arc::new(OpenAIProvider::new(
                    api_key.to_string(),
                    Some(self.api_base.clone()),
                ));
                let reliable: Arc<dyn LLMProvider> = Arc::new(ReliableProvider::new(p, 2, 250));
                reliable
            })
            .clone();
        Ok(provider)
    }
}
