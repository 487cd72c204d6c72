//! Durable (namespace, key) → value store.
//!
//! Backs activation tracking and the last-known-good APN. Process-wide, one
//! file, full image rewritten through a temp-file rename on every mutation so
//! a crash never leaves a torn image behind.

use color_eyre::Result;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

/// ICCID → activation progress entries.
pub const NS_PENDING_ACTIVATION: &str = "pending-activation";
/// ICCID → serialized last-known-good APN entries.
pub const NS_LAST_GOOD_APN: &str = "last-good-apn";

pub struct Store {
    path: PathBuf,
    entries: DashMap<String, String>,
}

impl Store {
    /// Open the store, loading the existing image when there is one.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = DashMap::new();

        match fs::read(&path).await {
            Ok(bytes) => {
                let image: HashMap<String, String> = serde_json::from_slice(&bytes)?;
                for (key, value) in image {
                    entries.insert(key, value);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no store image yet, starting empty");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self { path, entries })
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<String> {
        self.entries
            .get(&entry_key(namespace, key))
            .map(|e| e.value().clone())
    }

    pub async fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        self.entries
            .insert(entry_key(namespace, key), value.to_string());
        self.flush().await
    }

    /// Removing an absent key is a no-op that still succeeds.
    pub async fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        if self.entries.remove(&entry_key(namespace, key)).is_none() {
            return Ok(());
        }
        self.flush().await
    }

    async fn flush(&self) -> Result<()> {
        let image: HashMap<String, String> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let json = serde_json::to_vec_pretty(&image)?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &json).await?;
        fs::rename(&tmp, &self.path).await?;

        Ok(())
    }
}

fn entry_key(namespace: &str, key: &str) -> String {
    format!("{namespace}/{key}")
}
