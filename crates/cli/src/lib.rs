pub mod onboard;
pub mod verify;

use anyhow::Context;
use onboard::OnboardAnswers;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};
use zapdesk_core::bus::NotificationBus;
use zapdesk_core::config::{AppConfig, ChannelBinding};
use zapdesk_engine::{Engine, EngineConfig};
use zapdesk_persistence::{NewChannel, SqliteStore};
use zapdesk_server::gateway::{Gateway, GatewayRuntimeConfig};
use zapdesk_whatsapp::BridgeTransport;

const BUS_CAPACITY: usize = 1024;

pub fn get_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".zapdesk")
}

pub fn default_config_path() -> PathBuf {
    get_config_dir().join("config.json")
}

/// Stdout gets everything the env filter lets through except the `exception`
/// target, which goes to a daily `exceptions.jsonl` file instead.
pub fn init_tracing(log_dir: &Path) -> WorkerGuard {
    let (non_blocking, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
        log_dir,
        "exceptions.jsonl",
    ));

    let exception_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_level(false)
        .with_file(false)
        .with_line_number(false)
        .without_time()
        .with_filter(
            tracing_subscriber::filter::Targets::new().with_target("exception", Level::ERROR),
        );

    let stdout_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_filter(stdout_filter)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target() != "exception"
        }));

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(exception_layer)
        .init();

    guard
}

pub fn load_config(path: Option<PathBuf>) -> anyhow::Result<AppConfig> {
    let path = path.unwrap_or_else(default_config_path);
    AppConfig::load(Some(path.clone()))
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

pub async fn open_engine(config: &AppConfig) -> anyhow::Result<Engine> {
    let store = SqliteStore::new(&config.database_url).await?;
    let bus = Arc::new(NotificationBus::new(BUS_CAPACITY));
    Ok(Engine::new(store, bus, EngineConfig::from_app(config)))
}

/// Register a bridge session per configured channel and start its listener.
/// Bindings that do not match a stored channel are skipped.
pub async fn attach_channels(engine: &Engine, config: &AppConfig) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let mut listeners = Vec::with_capacity(config.channels.len());
    for binding in &config.channels {
        match engine.store().get_channel(binding.id).await? {
            None => {
                warn!(channel_id = binding.id, "Configured channel not found in database, skipping");
                continue;
            }
            Some(channel) if channel.tenant_id != binding.tenant_id => {
                warn!(
                    channel_id = binding.id,
                    configured_tenant = binding.tenant_id,
                    stored_tenant = channel.tenant_id,
                    "Channel tenant mismatch, skipping"
                );
                continue;
            }
            Some(_) => {}
        }

        let transport = Arc::new(BridgeTransport::new(binding.id, &config.bridge));
        let session = engine.sessions().register(binding.tenant_id, transport).await;
        listeners.push(engine.start_listening(session));
    }
    Ok(listeners)
}

pub async fn run_serve(config: AppConfig) -> anyhow::Result<()> {
    let engine = open_engine(&config).await?;
    let listeners = attach_channels(&engine, &config).await?;
    info!(channels = listeners.len(), "Channels attached");
    let sweeper = engine.start_sweeper();

    let gateway = Gateway::new(engine.clone(), &config.gateway, GatewayRuntimeConfig::default());
    println!("Zapdesk gateway starting on port {}", config.gateway.port);
    println!("Press Ctrl+C to stop");

    tokio::select! {
        res = gateway.start() => res?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
    }

    sweeper.abort();
    for listener in listeners {
        listener.abort();
    }
    Ok(())
}

/// Resolve a number to its WhatsApp jid through the given channel's bridge.
pub async fn run_check_number(config: &AppConfig, channel_id: i64, number: &str) -> anyhow::Result<String> {
    let engine = open_engine(config).await?;
    let transport = BridgeTransport::new(channel_id, &config.bridge);
    let lookup = engine.check_number(&transport, number).await?;
    Ok(lookup.jid)
}

pub async fn seed_first_channel(store: &SqliteStore, answers: &OnboardAnswers) -> anyhow::Result<ChannelBinding> {
    let tenant = store.create_tenant(&answers.tenant_name, &[]).await?;
    let channel = store
        .create_channel(&NewChannel {
            tenant_id: tenant.id,
            name: answers.channel_name.clone(),
            greeting_message: answers.greeting_message.clone(),
            ..Default::default()
        })
        .await?;
    info!(tenant_id = tenant.id, channel_id = channel.id, "Seeded first channel");
    Ok(ChannelBinding {
        id: channel.id,
        tenant_id: tenant.id,
    })
}

pub async fn run_onboarding(config_path: PathBuf) -> anyhow::Result<()> {
    let probe = config_path.clone();
    if !tokio::task::spawn_blocking(move || onboard::confirm_overwrite(&probe)).await?? {
        println!("Aborted.");
        return Ok(());
    }

    let answers = tokio::task::spawn_blocking(onboard::prompt_answers).await??;
    let store = SqliteStore::new(&answers.database_url).await?;
    let binding = seed_first_channel(&store, &answers).await?;
    let config = onboard::build_config(&answers, vec![binding.clone()]);
    onboard::write_config(&config, &config_path)?;

    println!("\nZapdesk is ready!");
    println!("  Config: {}", config_path.display());
    println!("  Channel {} bound to tenant {}", binding.id, binding.tenant_id);
    println!("\nNext steps:");
    println!("  1. Pair the bridge session for channel {}", binding.id);
    println!("  2. Start serving: zapdesk serve");
    Ok(())
}

pub async fn run_status(config_path: Option<PathBuf>) {
    let path = config_path.unwrap_or_else(default_config_path);
    println!("Zapdesk status\n");

    if path.exists() {
        println!("Config: {} ✓", path.display());
    } else {
        println!("Config: {} ✗ (run 'zapdesk onboard')", path.display());
        return;
    }

    let config = match load_config(Some(path)) {
        Ok(config) => config,
        Err(e) => {
            println!("Error loading config: {:#}", e);
            return;
        }
    };

    println!("Database: {}", config.database_url);
    println!("Gateway port: {}", config.gateway.port);
    let check = |name: &str, has: bool| {
        if has {
            println!("{}: ✓", name);
        } else {
            println!("{}: not set", name);
        }
    };
    check("Gateway auth token", config.gateway.auth_token.is_some());
    check("Bridge signing secret", config.gateway.bridge_secret.is_some());
    println!("Channels: {}", config.channels.len());

    match verify::verify_bridge(&config.bridge).await {
        Ok(msg) => println!("{}", msg),
        Err(e) => println!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answers() -> OnboardAnswers {
        OnboardAnswers {
            database_url: "sqlite::memory:".to_string(),
            public_dir: PathBuf::from("public"),
            frontend_url: None,
            port: 8080,
            auth_token: None,
            bridge_secret: None,
            bridge_api_base: "http://127.0.0.1:9".to_string(),
            bridge_token: None,
            ai_api_base: "http://127.0.0.1:9/v1".to_string(),
            tenant_name: "Acme".to_string(),
            channel_name: "Suporte".to_string(),
            greeting_message: Some("Olá!".to_string()),
        }
    }

    #[tokio::test]
    async fn test_seed_then_attach_skips_unknown_bindings() {
        let store = SqliteStore::in_memory().await.unwrap();
        let binding = seed_first_channel(&store, &answers()).await.unwrap();

        let channel = store.get_channel(binding.id).await.unwrap().unwrap();
        assert_eq!(channel.name, "Suporte");
        assert_eq!(channel.greeting_message.as_deref(), Some("Olá!"));

        let config = onboard::build_config(
            &answers(),
            vec![
                binding.clone(),
                ChannelBinding { id: 999, tenant_id: binding.tenant_id },
                ChannelBinding { id: binding.id, tenant_id: binding.tenant_id + 1 },
            ],
        );
        let engine = Engine::new(store, Arc::new(NotificationBus::new(16)), EngineConfig::from_app(&config));
        let listeners = attach_channels(&engine, &config).await.unwrap();

        assert_eq!(listeners.len(), 1);
        assert_eq!(engine.sessions().channel_ids().await, vec![binding.id]);
        for listener in listeners {
            listener.abort();
        }
    }

    #[test]
    fn test_missing_config_is_reported_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(dir.path().join("nope.json"))).unwrap_err();
        assert!(format!("{:#}", err).contains("nope.json"));
    }
}
