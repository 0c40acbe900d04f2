use crate::{ChatMessage, GenerationOptions, GenerationResponse, LLMProvider, ProviderError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retries transient provider failures with bounded exponential backoff.
pub struct ReliableProvider {
    inner: Arc<dyn LLMProvider>,
    max_retries: u32,
    base_backoff_ms: u64,
}

impl ReliableProvider {
    pub fn new(inner: Arc<dyn LLMProvider>, max_retries: u32, base_backoff_ms: u64) -> Self {
        Self {
            inner,
            max_retries,
            base_backoff_ms: base_backoff_ms.max(100),
        }
    }

    pub(crate) fn is_retryable(err: &ProviderError) -> bool {
        match err {
            ProviderError::NetworkError(_) => true,
            ProviderError::ApiError(message) => {
                let lower = message.to_lowercase();
                lower.contains("429")
                    || lower.contains("rate limit")
                    || lower.contains("too many requests")
                    || lower.contains("timeout")
                    || lower.contains("temporar")
                    || lower.contains("unavailable")
                    || lower.contains("503")
            }
            ProviderError::ConfigError(_) => false,
        }
    }

    async fn with_retries<T, F, Fut>(&self, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut backoff_ms = self.base_backoff_ms;
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !Self::is_retryable(&err) || attempt == self.max_retries {
                        return Err(err);
                    }
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_retries + 1,
                        backoff_ms,
                        "provider call failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms.saturating_mul(2)).min(2_000);
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl LLMProvider for ReliableProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, ProviderError> {
        self.with_retries(|| self.inner.chat(messages, options)).await
    }

    async fn transcribe(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        model: &str,
    ) -> Result<String, ProviderError> {
        self.with_retries(|| self.inner.transcribe(audio.clone(), file_name, model))
            .await
    }

    async fn synthesize(&self, text: &str, voice: &str, model: &str) -> Result<Vec<u8>, ProviderError> {
        self.with_retries(|| self.inner.synthesize(text, voice, model))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
        error: fn() -> ProviderError,
    }

    #[async_trait]
    impl LLMProvider for Flaky {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _options: &GenerationOptions,
        ) -> Result<GenerationResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err((self.error)());
            }
            Ok(GenerationResponse {
                content: "ok".to_string(),
                usage: None,
            })
        }
    }

    fn options() -> GenerationOptions {
        GenerationOptions {
            model: "m".to_string(),
            max_tokens: None,
            temperature: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let inner = Arc::new(Flaky {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
            error: || ProviderError::ApiError("429 Too Many Requests".to_string()),
        });
        let provider = ReliableProvider::new(inner.clone(), 2, 100);
        let resp = provider.chat(&[], &options()).await.unwrap();
        assert_eq!(resp.content, "ok");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_config_errors_fail_fast() {
        let inner = Arc::new(Flaky {
            failures_left: AtomicU32::new(1),
            calls: AtomicU32::new(0),
            error: || ProviderError::ConfigError("no key".to_string()),
        });
        let provider = ReliableProvider::new(inner.clone(), 3, 100);
        assert!(provider.chat(&[], &options()).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
