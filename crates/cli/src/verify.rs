use anyhow::Result;
use reqwest::Client;
use tracing::info;
use zapdesk_core::config::BridgeConfig;

fn trimmed_base(api_base: &str) -> &str {
    api_base.trim_end_matches('/')
}

/// Ping the bridge sidecar's health route.
pub async fn verify_bridge(config: &BridgeConfig) -> Result<String> {
    let url = format!("{}/health", trimmed_base(&config.api_base));
    let mut req = Client::new().get(&url);
    if let Some(token) = &config.token {
        req = req.bearer_auth(token);
    }

    let res = req.send().await?;
    let status = res.status();
    if status.is_success() {
        info!(url = %url, "Bridge reachable");
        Ok(format!("✅ Bridge reachable at {} (HTTP {})", config.api_base, status))
    } else {
        Err(anyhow::anyhow!("❌ Bridge answered HTTP {} at {}", status, url))
    }
}

/// Verify an AI prompt's API key by listing the models it can see.
pub async fn verify_api_key(api_base: &str, api_key: &str) -> Result<String> {
    let url = format!("{}/models", trimmed_base(api_base));
    let res = Client::new().get(&url).bearer_auth(api_key).send().await?;
    let status = res.status();

    if status.is_success() {
        Ok(format!("✅ API key is valid (HTTP {})", status))
    } else {
        let body = res.text().await.unwrap_or_default();
        Err(anyhow::anyhow!(
            "❌ API key verification failed (HTTP {}): {}",
            status,
            body.chars().take(200).collect::<String>()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trimmed_base() {
        assert_eq!(trimmed_base("http://localhost:3000/"), "http://localhost:3000");
        assert_eq!(trimmed_base("http://x/v1"), "http://x/v1");
    }
}
