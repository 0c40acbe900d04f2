use crate::{IntentEngine, IntentQuery, IntentResult, ProviderError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::Client;
use tracing::debug;

/// Intent detection over a JSON HTTP endpoint.
pub struct HttpIntentEngine {
    client: Client,
}

impl HttpIntentEngine {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpIntentEngine {
    fn default() -> Self {
        Self::new()
    }
}

pub fn encode_audio(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

#[async_trait]
impl IntentEngine for HttpIntentEngine {
    async fn query(&self, endpoint: &str, query: &IntentQuery) -> Result<IntentResult, ProviderError> {
        debug!(session = %query.session, project = %query.project_name, "Querying intent engine");
        let res = self
            .client
            .post(endpoint)
            .json(query)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let error_text = res
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::ApiError(format!("{status}: {error_text}")));
        }

        res.json::<IntentResult>()
            .await
            .map_err(|e| ProviderError::ApiError(format!("Failed to parse intent result: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_defaults_missing_fields() {
        let result: IntentResult = serde_json::from_value(json!({
            "responses": [{"text": "Olá"}, {"text": "Como posso ajudar?"}]
        }))
        .unwrap();
        assert_eq!(result.responses.len(), 2);
        assert!(!result.end_conversation);
        assert!(result.encoded_audio.is_none());
    }

    #[test]
    fn test_query_omits_absent_audio() {
        let query = IntentQuery {
            session: "5511999990000".to_string(),
            project_name: "suporte".to_string(),
            text: "oi".to_string(),
            language_code: "pt-BR".to_string(),
            audio: None,
        };
        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(value["projectName"], "suporte");
        assert!(value.get("audio").is_none());
        assert_eq!(encode_audio(b"ok"), "b2s=");
    }
}
