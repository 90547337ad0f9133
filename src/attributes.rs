//! Filesystem attributes record at `meta/attributes`.
//!
//! Human-inspectable JSON carrying the filesystem's encryption flags. The
//! raw encryption key is only ever written in no-network mode, where no
//! cluster exists to hold it as shares.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::keys::Key;
use crate::store::write_atomic;

pub const ATTRIBUTES_FILENAME: &str = "attributes";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemAttributes {
    pub encrypted: bool,
    #[serde(rename = "keygenerated")]
    pub key_generated: bool,
    #[serde(rename = "networkoff")]
    pub network_off: bool,
    #[serde(rename = "encryptionkey", default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<Key>,
}

impl FileSystemAttributes {
    /// Load from `meta_dir`, or `None` if the record does not exist yet.
    pub async fn load(meta_dir: &Path) -> anyhow::Result<Option<Self>> {
        let path = meta_dir.join(ATTRIBUTES_FILENAME);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        let attributes: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("corrupt attributes record {}", path.display()))?;
        debug!(
            encrypted = attributes.encrypted,
            network_off = attributes.network_off,
            "loaded filesystem attributes"
        );
        Ok(Some(attributes))
    }

    /// Write to `meta_dir`, dropping the key unless networking is off.
    pub async fn save(&self, meta_dir: &Path) -> anyhow::Result<()> {
        let mut record = self.clone();
        if !record.network_off {
            record.encryption_key = None;
        }
        let path = meta_dir.join(ATTRIBUTES_FILENAME);
        let json = serde_json::to_vec_pretty(&record).context("failed to encode attributes")?;
        write_atomic(&path, &json)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }
}
