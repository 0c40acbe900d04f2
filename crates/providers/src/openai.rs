use crate::{ChatMessage, GenerationOptions, GenerationResponse, LLMProvider, ProviderError, Usage};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::{json, Value};

pub struct OpenAIProvider {
    api_key: String,
    api_base: String,
    client: Client,
}

impl OpenAIProvider {
    pub fn new(api_key: String, api_base: Option<String>) -> Self {
        Self {
            api_key,
            api_base: api_base.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            client: Client::new(),
        }
    }

    async fn check(res: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status();
        let error_text = res
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(ProviderError::ApiError(format!("{status}: {error_text}")))
    }
}

pub(crate) fn chat_body(messages: &[ChatMessage], options: &GenerationOptions) -> Value {
    let mut body = json!({
        "model": options.model,
        "messages": messages,
    });
    if let Some(max_tokens) = options.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = options.temperature {
        body["temperature"] = json!(temperature);
    }
    body
}

pub(crate) fn parse_chat_response(json: &Value) -> GenerationResponse {
    let content = json["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    let usage = json.get("usage").map(|usage_json| Usage {
        input_tokens: usage_json["prompt_tokens"].as_u64().unwrap_or(0) as usize,
        output_tokens: usage_json["completion_tokens"].as_u64().unwrap_or(0) as usize,
    });

    GenerationResponse { content, usage }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.api_base);

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&chat_body(messages, options))
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;
        let res = Self::check(res).await?;

        let json: Value = res
            .json()
            .await
            .map_err(|e| ProviderError::ApiError(format!("Failed to parse response: {}", e)))?;

        Ok(parse_chat_response(&json))
    }

    async fn transcribe(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        model: &str,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/audio/transcriptions", self.api_base);
        let form = Form::new()
            .text("model", model.to_string())
            .part("file", Part::bytes(audio).file_name(file_name.to_string()));

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;
        let res = Self::check(res).await?;

        let json: Value = res
            .json()
            .await
            .map_err(|e| ProviderError::ApiError(format!("Failed to parse transcription: {}", e)))?;
        Ok(json["text"].as_str().unwrap_or_default().to_string())
    }

    async fn synthesize(&self, text: &str, voice: &str, model: &str) -> Result<Vec<u8>, ProviderError> {
        let url = format!("{}/audio/speech", self.api_base);
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": model, "input": text, "voice": voice, "response_format": "mp3" }))
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;
        let res = Self::check(res).await?;

        let bytes = res
            .bytes()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatRole;

    #[test]
    fn test_chat_body_carries_roles_and_limits() {
        let messages = vec![
            ChatMessage::new(ChatRole::System, "be nice"),
            ChatMessage::new(ChatRole::User, "oi"),
        ];
        let body = chat_body(
            &messages,
            &GenerationOptions {
                model: "gpt-3.5-turbo-1106".to_string(),
                max_tokens: Some(100),
                temperature: Some(0.5),
            },
        );
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "oi");
        assert_eq!(body["max_tokens"], 100);
    }

    #[test]
    fn test_parse_response_without_usage() {
        let parsed = parse_chat_response(&json!({
            "choices": [{"message": {"role": "assistant", "content": "Olá!"}}]
        }));
        assert_eq!(parsed.content, "Olá!");
        assert!(parsed.usage.is_none());
    }
}
