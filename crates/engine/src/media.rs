use crate::normalizer::media_details;
use crate::Engine;
use chrono::Utc;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, instrument};
use zapdesk_core::protocol::RawMessage;
use zapdesk_core::transport::{TransportError, WhatsAppTransport};

#[derive(Debug, Error)]
pub enum MediaDownloadError {
    #[error("Media download failed: {0}")]
    Transport(#[from] TransportError),
    #[error("Message carries no media")]
    NoMedia,
    #[error("Could not determine the media type")]
    UnknownMimeType,
    #[error("Media exceeds the {limit} byte limit")]
    TooLarge { limit: usize },
    #[error("Failed to write media: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMedia {
    pub file_name: String,
    pub path: PathBuf,
    pub mimetype: String,
}

impl StoredMedia {
    /// Top-level mime type, stored as the message's media type.
    pub fn media_type(&self) -> &str {
        self.mimetype.split('/').next().unwrap_or_default()
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `{millis}_{random}_{original}` for documents, `{millis}_{random}.{ext}` otherwise.
pub fn media_file_name(original: Option<&str>, mimetype: &str, millis: i64, random: &str) -> String {
    match original.filter(|n| !n.trim().is_empty()) {
        Some(name) => format!("{millis}_{random}_{}", sanitize(name)),
        None => {
            let subtype = mimetype.split('/').nth(1).unwrap_or("bin");
            let ext = subtype.split(';').next().unwrap_or("bin").trim();
            format!("{millis}_{random}.{ext}")
        }
    }
}

impl Engine {
    #[instrument(skip(self, transport, raw), fields(message_id = %raw.external_id()))]
    pub async fn download_media(
        &self,
        transport: &dyn WhatsAppTransport,
        raw: &RawMessage,
        tenant_id: i64,
    ) -> Result<StoredMedia, MediaDownloadError> {
        if raw.message.is_none() {
            return Err(MediaDownloadError::NoMedia);
        }
        let (declared, original_name) = media_details(raw);

        let bytes = transport.download_media(raw).await?;
        let limit = self.config.attachments.max_size_bytes;
        if bytes.len() > limit {
            return Err(MediaDownloadError::TooLarge { limit });
        }

        let mimetype = declared
            .filter(|m| !m.is_empty())
            .or_else(|| infer::get(&bytes).map(|k| k.mime_type().to_string()))
            .ok_or(MediaDownloadError::UnknownMimeType)?;

        let random = uuid::Uuid::new_v4().simple().to_string();
        let file_name = media_file_name(
            original_name.as_deref(),
            &mimetype,
            Utc::now().timestamp_millis(),
            &random[..8],
        );

        let dir = self.config.attachments.tenant_directory(tenant_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(&file_name);
        tokio::fs::write(&path, &bytes).await?;
        info!(file = %file_name, size = bytes.len(), "Media stored");

        Ok(StoredMedia {
            file_name,
            path,
            mimetype,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, CUSTOMER};
    use serde_json::json;

    #[test]
    fn test_file_names() {
        assert_eq!(
            media_file_name(Some("relatório final.pdf"), "application/pdf", 1700, "abcd1234"),
            "1700_abcd1234_relat_rio_final.pdf"
        );
        assert_eq!(
            media_file_name(None, "audio/ogg; codecs=opus", 1700, "abcd1234"),
            "1700_abcd1234.ogg"
        );
    }

    fn image_message() -> RawMessage {
        serde_json::from_value(json!({
            "key": {"remoteJid": CUSTOMER, "id": "IMG1"},
            "message": {"imageMessage": {"caption": "foto"}}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_sniffs_mime_and_writes_under_tenant_dir() {
        let fx = fixture().await;
        let png = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        fx.transport.set_media(png.clone());

        let stored = fx
            .engine
            .download_media(fx.transport.as_ref(), &image_message(), fx.tenant.id)
            .await
            .unwrap();
        assert_eq!(stored.mimetype, "image/png");
        assert_eq!(stored.media_type(), "image");
        assert!(stored.file_name.ends_with(".png"));
        assert!(stored
            .path
            .starts_with(fx.engine.config.attachments.tenant_directory(fx.tenant.id)));
        assert_eq!(tokio::fs::read(&stored.path).await.unwrap(), png);
    }

    #[tokio::test]
    async fn test_missing_bytes_is_an_error() {
        let fx = fixture().await;
        let err = fx
            .engine
            .download_media(fx.transport.as_ref(), &image_message(), fx.tenant.id)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaDownloadError::Transport(TransportError::EmptyMedia)));
    }
}
