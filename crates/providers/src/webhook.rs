use crate::{FlowClient, ProviderError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

pub struct HttpFlowClient {
    client: Client,
}

impl HttpFlowClient {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }
}

#[async_trait]
impl FlowClient for HttpFlowClient {
    async fn deliver(&self, url: &str, payload: &Value) -> Result<Value, ProviderError> {
        let res = self
            .client
            .post(url)
            .json(payload)
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

        // Webhooks frequently answer with an empty body.
        let text = res
            .text()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;
        Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
    }
}
