use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentPolicy {
    /// Maximum size in bytes per downloaded file.
    pub max_size_bytes: usize,
    /// Root directory; files land in `{storage_directory}/company{tenant_id}/`.
    pub storage_directory: PathBuf,
}

impl Default for AttachmentPolicy {
    fn default() -> Self {
        Self {
            max_size_bytes: 64 * 1024 * 1024,
            storage_directory: PathBuf::from("public"),
        }
    }
}

impl AttachmentPolicy {
    pub fn tenant_directory(&self, tenant_id: i64) -> PathBuf {
        self.storage_directory.join(format!("company{tenant_id}"))
    }
}
