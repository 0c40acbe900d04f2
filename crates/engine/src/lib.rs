//! Conversation engine: turns transport events into CRM state and replies.

pub mod acks;
pub mod cache;
pub mod calls;
pub mod contacts;
pub mod debounce;
pub mod identity;
pub mod listener;
pub mod media;
pub mod normalizer;
pub mod pipeline;
pub mod rating;
pub mod registry;
pub mod routing;
pub mod schedule;
pub mod send;
pub mod settings;
pub mod sweeper;
pub mod template;
pub mod tickets;

#[cfg(test)]
pub(crate) mod testing;

use cache::{Cache, MemoryCache};
use debounce::Debouncer;
use identity::IdentityResolver;
use registry::{Session, SessionRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use zapdesk_core::attachment::AttachmentPolicy;
use zapdesk_core::bus::NotificationBus;
use zapdesk_core::config::{AiConfig, AppConfig, PipelineConfig};
use zapdesk_core::error::CrmError;
use zapdesk_core::metrics::MetricsStore;
use zapdesk_persistence::SqliteStore;
use zapdesk_providers::factory::{CachedProviderFactory, ProviderFactory};
use zapdesk_providers::intent::HttpIntentEngine;
use zapdesk_providers::webhook::HttpFlowClient;
use zapdesk_providers::{FlowClient, IntentEngine};

/// Invisible marker prefixed to every automated outbound body.
pub const BOT_MARKER: char = '\u{200e}';

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub pipeline: PipelineConfig,
    pub ai: AiConfig,
    pub attachments: AttachmentPolicy,
    /// Base used for the placeholder profile picture.
    pub frontend_url: Option<String>,
}

impl EngineConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            pipeline: config.pipeline.clone(),
            ai: config.ai.clone(),
            attachments: config.attachment_policy(),
            frontend_url: config.frontend_url.clone(),
        }
    }
}

/// Shared handle to every collaborator the pipeline needs. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    pub(crate) store: SqliteStore,
    pub(crate) bus: Arc<NotificationBus>,
    pub(crate) cache: Arc<dyn Cache>,
    pub(crate) sessions: Arc<SessionRegistry>,
    pub(crate) identity: Arc<IdentityResolver>,
    pub(crate) providers: Arc<dyn ProviderFactory>,
    pub(crate) intent: Arc<dyn IntentEngine>,
    pub(crate) flow: Arc<dyn FlowClient>,
    pub(crate) debouncer: Debouncer,
    pub(crate) ack_permits: Arc<Semaphore>,
    pub(crate) metrics: Arc<MetricsStore>,
    pub(crate) config: Arc<EngineConfig>,
}

impl Engine {
    pub fn new(store: SqliteStore, bus: Arc<NotificationBus>, config: EngineConfig) -> Self {
        Self {
            store,
            bus,
            cache: Arc::new(MemoryCache::new()),
            sessions: Arc::new(SessionRegistry::new()),
            identity: Arc::new(IdentityResolver::new()),
            providers: Arc::new(CachedProviderFactory::new(&config.ai)),
            intent: Arc::new(HttpIntentEngine::new()),
            flow: Arc::new(HttpFlowClient::new(Duration::from_secs(15))),
            debouncer: Debouncer::new(),
            ack_permits: Arc::new(Semaphore::new(config.pipeline.ack_concurrency.max(1))),
            metrics: MetricsStore::new(),
            config: Arc::new(config),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_providers(mut self, providers: Arc<dyn ProviderFactory>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_intent_engine(mut self, intent: Arc<dyn IntentEngine>) -> Self {
        self.intent = intent;
        self
    }

    pub fn with_flow_client(mut self, flow: Arc<dyn FlowClient>) -> Self {
        self.flow = flow;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsStore>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub async fn session(&self, channel_id: i64) -> Result<Arc<Session>, CrmError> {
        self.sessions
            .get(channel_id)
            .await
            .ok_or(CrmError::SessionNotFound)
    }
}
