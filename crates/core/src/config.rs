use crate::attachment::AttachmentPolicy;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_public_dir")]
    pub public_dir: PathBuf,
    #[serde(default)]
    pub frontend_url: Option<String>,
    #[serde(default)]
    pub gateway: GatewayConfig,
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub channels: Vec<ChannelBinding>,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn default_database_url() -> String {
    "sqlite://zapdesk.db?mode=rwc".to_string()
}

fn default_public_dir() -> PathBuf {
    PathBuf::from("public")
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required on agent endpoints when set.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// HMAC secret for bridge event signatures when set.
    #[serde(default)]
    pub bridge_secret: Option<String>,
}

fn default_port() -> u16 {
    8080
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            auth_token: None,
            bridge_secret: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BridgeConfig {
    pub api_base: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,
}

fn default_max_inflight() -> usize {
    8
}

fn default_retry_jitter_ms() -> u64 {
    250
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ChannelBinding {
    pub id: i64,
    pub tenant_id: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AiConfig {
    #[serde(default = "default_ai_base")]
    pub api_base: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    #[serde(default = "default_speech_model")]
    pub speech_model: String,
}

fn default_ai_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-3.5-turbo-1106".to_string()
}

fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

fn default_speech_model() -> String {
    "tts-1".to_string()
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_base: default_ai_base(),
            chat_model: default_chat_model(),
            transcription_model: default_transcription_model(),
            speech_model: default_speech_model(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    #[serde(default = "default_ack_concurrency")]
    pub ack_concurrency: usize,
    #[serde(default = "default_out_of_hours_debounce_ms")]
    pub out_of_hours_debounce_ms: u64,
    #[serde(default = "default_greeting_debounce_ms")]
    pub greeting_debounce_ms: u64,
    #[serde(default = "default_intent_debounce_ms")]
    pub intent_debounce_ms: u64,
    #[serde(default = "default_call_notice_debounce_ms")]
    pub call_notice_debounce_ms: u64,
    #[serde(default = "default_sweeper_interval_secs")]
    pub sweeper_interval_secs: u64,
}

fn default_ack_concurrency() -> usize {
    5
}

fn default_out_of_hours_debounce_ms() -> u64 {
    3000
}

fn default_greeting_debounce_ms() -> u64 {
    1000
}

fn default_intent_debounce_ms() -> u64 {
    4000
}

fn default_call_notice_debounce_ms() -> u64 {
    3000
}

fn default_sweeper_interval_secs() -> u64 {
    60
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ack_concurrency: default_ack_concurrency(),
            out_of_hours_debounce_ms: default_out_of_hours_debounce_ms(),
            greeting_debounce_ms: default_greeting_debounce_ms(),
            intent_debounce_ms: default_intent_debounce_ms(),
            call_notice_debounce_ms: default_call_notice_debounce_ms(),
            sweeper_interval_secs: default_sweeper_interval_secs(),
        }
    }
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".zapdesk/config.json")
    }

    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config_path = custom_path.unwrap_or_else(Self::default_path);

        let s = Config::builder()
            .add_source(File::from(config_path).required(true))
            // ZAPDESK__GATEWAY__PORT=9000
            .add_source(Environment::with_prefix("ZAPDESK").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    pub fn attachment_policy(&self) -> AttachmentPolicy {
        AttachmentPolicy {
            storage_directory: self.public_dir.clone(),
            ..AttachmentPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_defaults_apply_to_partial_section() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{"bridge": {"api_base": "http://localhost:3000"}, "pipeline": {"ack_concurrency": 2}}"#,
        )
        .unwrap();
        assert_eq!(cfg.pipeline.ack_concurrency, 2);
        assert_eq!(cfg.pipeline.out_of_hours_debounce_ms, 3000);
        assert_eq!(cfg.pipeline.greeting_debounce_ms, 1000);
        assert_eq!(cfg.pipeline.intent_debounce_ms, 4000);
        assert_eq!(cfg.gateway.port, 8080);
        assert_eq!(cfg.bridge.max_inflight, 8);
        assert!(cfg.channels.is_empty());
    }
}
