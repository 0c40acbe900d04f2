pub mod factory;
pub mod intent;
pub mod openai;
pub mod reliable;
pub mod webhook;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("API error: {0}")]
    ApiError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Network error: {0}")]
    NetworkError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub model: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub content: String,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone)]
pub struct Usage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Chat completion plus the speech endpoints AI prompts rely on.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, ProviderError>;

    async fn transcribe(
        &self,
        _audio: Vec<u8>,
        _file_name: &str,
        _model: &str,
    ) -> Result<String, ProviderError> {
        Err(ProviderError::ConfigError(
            "transcription not supported by this provider".to_string(),
        ))
    }

    async fn synthesize(
        &self,
        _text: &str,
        _voice: &str,
        _model: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        Err(ProviderError::ConfigError(
            "speech synthesis not supported by this provider".to_string(),
        ))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentQuery {
    pub session: String,
    pub project_name: String,
    pub text: String,
    pub language_code: String,
    /// Base64 encoded audio when the customer spoke instead of typing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResponseText {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResult {
    #[serde(default)]
    pub responses: Vec<IntentResponseText>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub end_conversation: bool,
    #[serde(default)]
    pub encoded_audio: Option<String>,
}

/// Natural-language intent detection service.
#[async_trait]
pub trait IntentEngine: Send + Sync {
    async fn query(&self, endpoint: &str, query: &IntentQuery) -> Result<IntentResult, ProviderError>;
}

/// Outbound POST to a flow builder or generic webhook.
#[async_trait]
pub trait FlowClient: Send + Sync {
    async fn deliver(
        &self,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;
}
