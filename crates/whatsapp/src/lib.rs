//! Transport backed by a WhatsApp Web bridge sidecar.
//!
//! The sidecar owns the protocol session (pairing, encryption, media keys) and
//! exposes it over HTTP per channel: `{api_base}/sessions/{channel_id}/...`.
//! Events flow the other way through the gateway's bridge intake route.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration as StdDuration, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};
use zapdesk_core::config::BridgeConfig;
use zapdesk_core::protocol::{MessageKey, RawMessage};
use zapdesk_core::transport::{
    GroupMetadata, LidMappingStore, NumberLookup, OutboundContent, TransportError,
    WhatsAppTransport,
};

const SEND_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct BridgeTransport {
    channel_id: i64,
    token: Option<String>,
    api_base: String,
    retry_jitter_ms: u64,
    send_permits: Arc<Semaphore>,
    client: Client,
}

#[derive(Deserialize)]
struct UrlReply {
    url: String,
}

#[derive(Deserialize)]
struct LidReply {
    lid: Option<String>,
}

#[derive(Deserialize)]
struct PnReply {
    pn: Option<String>,
}

impl BridgeTransport {
    pub fn new(channel_id: i64, config: &BridgeConfig) -> Self {
        Self {
            channel_id,
            token: config.token.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            retry_jitter_ms: config.retry_jitter_ms,
            send_permits: Arc::new(Semaphore::new(config.max_inflight.max(1))),
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/sessions/{}/{}", self.api_base, self.channel_id, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn jitter_delay(&self, attempt: u32) -> StdDuration {
        if self.retry_jitter_ms == 0 {
            return StdDuration::from_millis(0);
        }
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let jitter = (seed ^ ((attempt as u64) << 7)) % (self.retry_jitter_ms + 1);
        StdDuration::from_millis(jitter)
    }

    async fn read_response(res: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status().as_u16();
        let body = res.text().await.unwrap_or_default();
        Err(TransportError::Bridge { status, body })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, TransportError> {
        let res = self
            .authed(self.client.get(self.url(path)).query(query))
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Self::read_response(res)
            .await?
            .json()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response, TransportError> {
        let res = self
            .authed(self.client.post(self.url(path)).json(&body))
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Self::read_response(res).await
    }
}

#[async_trait]
impl WhatsAppTransport for BridgeTransport {
    fn channel_id(&self) -> i64 {
        self.channel_id
    }

    async fn send_message(
        &self,
        jid: &str,
        content: &OutboundContent,
    ) -> Result<RawMessage, TransportError> {
        let _permit = self
            .send_permits
            .acquire()
            .await
            .map_err(|_| TransportError::NotConnected)?;

        let payload = json!({ "jid": jid, "content": content });
        let mut delay = Duration::from_secs(1);
        let mut last_err = TransportError::NotConnected;
        for attempt in 1..=SEND_ATTEMPTS {
            match self.post("messages", payload.clone()).await {
                Ok(res) => {
                    info!(channel_id = self.channel_id, to = %jid, attempt, "Bridge outbound sent");
                    return res
                        .json::<RawMessage>()
                        .await
                        .map_err(|e| TransportError::Request(e.to_string()));
                }
                // Client errors will not get better on retry.
                Err(TransportError::Bridge { status, body }) if (400..500).contains(&status) => {
                    return Err(TransportError::Bridge { status, body });
                }
                Err(e) => {
                    warn!(channel_id = self.channel_id, attempt, error = %e, "Bridge outbound failed");
                    last_err = e;
                }
            }

            if attempt < SEND_ATTEMPTS {
                sleep(delay + self.jitter_delay(attempt)).await;
                delay *= 2;
            }
        }

        Err(last_err)
    }

    async fn download_media(&self, message: &RawMessage) -> Result<Vec<u8>, TransportError> {
        let res = self.post("media/download", json!({ "message": message })).await?;
        let bytes = res
            .bytes()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        if bytes.is_empty() {
            return Err(TransportError::EmptyMedia);
        }
        Ok(bytes.to_vec())
    }

    async fn on_whatsapp(&self, number: &str) -> Result<Vec<NumberLookup>, TransportError> {
        self.get_json("on-whatsapp", &[("number", number)]).await
    }

    async fn profile_picture_url(&self, jid: &str) -> Result<String, TransportError> {
        let reply: UrlReply = self.get_json("profile-picture", &[("jid", jid)]).await?;
        Ok(reply.url)
    }

    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata, TransportError> {
        self.get_json("group-metadata", &[("jid", jid)]).await
    }

    async fn read_messages(&self, keys: &[MessageKey]) -> Result<(), TransportError> {
        self.post("read", json!({ "keys": keys })).await.map(|_| ())
    }

    async fn reject_call(&self, call_id: &str, from: &str) -> Result<(), TransportError> {
        self.post("calls/reject", json!({ "id": call_id, "from": from }))
            .await
            .map(|_| ())
    }

    async fn send_presence(&self, jid: &str, presence: &str) -> Result<(), TransportError> {
        self.post("presence", json!({ "jid": jid, "presence": presence }))
            .await
            .map(|_| ())
    }

    fn lid_mapping(&self) -> Option<&dyn LidMappingStore> {
        Some(self)
    }
}

#[async_trait]
impl LidMappingStore for BridgeTransport {
    async fn lid_for_pn(&self, pn: &str) -> Result<Option<String>, TransportError> {
        let reply: LidReply = self.get_json("lid-mapping/lid", &[("pn", pn)]).await?;
        Ok(reply.lid)
    }

    async fn pn_for_lid(&self, lid: &str) -> Result<Option<String>, TransportError> {
        let reply: PnReply = self.get_json("lid-mapping/pn", &[("lid", lid)]).await?;
        Ok(reply.pn)
    }

    async fn store(&self, lid: &str, pn: &str) -> Result<(), TransportError> {
        self.post("lid-mapping", json!({ "lid": lid, "pn": pn }))
            .await
            .map(|_| ())
    }
}
