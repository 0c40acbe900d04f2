use inquire::{Confirm, Password, Text};
use std::fs;
use std::path::{Path, PathBuf};
use zapdesk_core::config::{
    AiConfig, AppConfig, BridgeConfig, ChannelBinding, GatewayConfig, PipelineConfig,
};

/// Everything the wizard asks before touching disk or database.
#[derive(Debug, Clone)]
pub struct OnboardAnswers {
    pub database_url: String,
    pub public_dir: PathBuf,
    pub frontend_url: Option<String>,
    pub port: u16,
    pub auth_token: Option<String>,
    pub bridge_secret: Option<String>,
    pub bridge_api_base: String,
    pub bridge_token: Option<String>,
    pub ai_api_base: String,
    pub tenant_name: String,
    pub channel_name: String,
    pub greeting_message: Option<String>,
}

fn optional(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub fn prompt_answers() -> anyhow::Result<OnboardAnswers> {
    println!("Welcome to the Zapdesk setup wizard!");
    println!("This wizard writes a configuration file and seeds your first channel.\n");

    let database_url = Text::new("SQLite database URL:")
        .with_default("sqlite://zapdesk.db?mode=rwc")
        .prompt()?;
    let public_dir = Text::new("Directory for received media:")
        .with_default("public")
        .prompt()?;
    let frontend_url = optional(
        Text::new("Agent UI URL (optional):")
            .with_default("")
            .prompt()?,
    );

    // --- Gateway ---
    let port = Text::new("Gateway port:")
        .with_default("8080")
        .prompt()?
        .parse::<u16>()?;
    let auth_token = if Confirm::new("Protect the agent API with a bearer token?")
        .with_default(true)
        .prompt()?
    {
        optional(Password::new("Bearer token:").without_confirmation().prompt()?)
    } else {
        None
    };

    // --- Bridge ---
    let bridge_api_base = Text::new("WhatsApp bridge URL:")
        .with_default("http://localhost:3000")
        .prompt()?;
    let bridge_token = optional(
        Password::new("Bridge API token (optional):")
            .without_confirmation()
            .prompt()?,
    );
    let bridge_secret = optional(
        Password::new("Bridge event signing secret (optional):")
            .without_confirmation()
            .prompt()?,
    );

    let ai_api_base = Text::new("OpenAI-compatible API base:")
        .with_default("https://api.openai.com/v1")
        .prompt()?;

    // --- First tenant ---
    let tenant_name = Text::new("Company name:").with_default("Minha Empresa").prompt()?;
    let channel_name = Text::new("WhatsApp connection name:")
        .with_default("Principal")
        .prompt()?;
    let greeting_message = optional(
        Text::new("Greeting for new conversations (optional):")
            .with_default("Olá {{name}}, seja bem-vindo!")
            .prompt()?,
    );

    Ok(OnboardAnswers {
        database_url,
        public_dir: PathBuf::from(public_dir),
        frontend_url,
        port,
        auth_token,
        bridge_secret,
        bridge_api_base,
        bridge_token,
        ai_api_base,
        tenant_name,
        channel_name,
        greeting_message,
    })
}

pub fn build_config(answers: &OnboardAnswers, channels: Vec<ChannelBinding>) -> AppConfig {
    AppConfig {
        database_url: answers.database_url.clone(),
        public_dir: answers.public_dir.clone(),
        frontend_url: answers.frontend_url.clone(),
        gateway: GatewayConfig {
            port: answers.port,
            auth_token: answers.auth_token.clone(),
            bridge_secret: answers.bridge_secret.clone(),
        },
        bridge: BridgeConfig {
            api_base: answers.bridge_api_base.clone(),
            token: answers.bridge_token.clone(),
            max_inflight: 8,
            retry_jitter_ms: 250,
        },
        channels,
        ai: AiConfig {
            api_base: answers.ai_api_base.clone(),
            ..AiConfig::default()
        },
        pipeline: PipelineConfig::default(),
    }
}

/// Asks before clobbering an existing file. True means go ahead.
pub fn confirm_overwrite(config_path: &Path) -> anyhow::Result<bool> {
    if !config_path.exists() {
        return Ok(true);
    }
    Ok(Confirm::new("Config file already exists. Overwrite?")
        .with_default(false)
        .prompt()?)
}

pub fn write_config(config: &AppConfig, config_path: &Path) -> anyhow::Result<()> {
    let config_json = serde_json::to_string_pretty(config)?;

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(config_path, config_json)?;
    fs::create_dir_all(&config.public_dir)?;
    Ok(())
}
