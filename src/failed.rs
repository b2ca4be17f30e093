use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

/// A message whose processing threw. The type fragment and raw body are
/// enough to re-run the exact same dispatch at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedMessage {
    pub kind: String,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    pub retries: u32,
}

/// Durable keyed store of failed messages, persisted as a JSON map so
/// entries survive restarts. Keys are `<repo>::<rev>` for commits and
/// `<did>::<kind>` for the identity-stream messages.
pub struct FailedMessageStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, FailedMessage>>,
}

impl FailedMessageStore {
    pub async fn load(path: PathBuf) -> Result<Self> {
        let entries = match tokio::fs::read(&path).await {
            Ok(data) => match serde_json::from_slice::<HashMap<String, FailedMessage>>(&data) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(
                        "Ignoring unreadable failed-message file {}: {}",
                        path.display(),
                        e
                    );
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub async fn insert(&self, key: &str, message: FailedMessage) -> Result<()> {
        let snapshot = {
            let mut entries = self.entries.lock().await;
            entries.insert(key.to_string(), message);
            entries.clone()
        };
        self.persist(&snapshot).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        let snapshot = {
            let mut entries = self.entries.lock().await;
            entries.remove(key);
            entries.clone()
        };
        self.persist(&snapshot).await
    }

    /// Snapshot and clear all entries; the replay loop reinserts the ones
    /// that fail again.
    pub async fn drain(&self) -> Result<Vec<(String, FailedMessage)>> {
        let (drained, snapshot) = {
            let mut entries = self.entries.lock().await;
            let drained: Vec<_> = entries.drain().collect();
            (drained, entries.clone())
        };
        self.persist(&snapshot).await?;
        Ok(drained)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn persist(&self, entries: &HashMap<String, FailedMessage>) -> Result<()> {
        let data = serde_json::to_vec(entries)?;
        tokio::fs::write(&self.path, data).await.with_context(|| {
            format!(
                "Failed to write failed-message file {}",
                self.path.display()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let unique = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("{}-{}-{}.json", name, std::process::id(), unique))
    }

    #[tokio::test]
    async fn insert_persist_reload() {
        let path = temp_path("failed-roundtrip");
        let store = FailedMessageStore::load(path.clone()).await.unwrap();
        store
            .insert(
                "did:plc:alice::rev1",
                FailedMessage {
                    kind: "#commit".to_string(),
                    body: vec![1, 2, 3],
                    retries: 0,
                },
            )
            .await
            .unwrap();

        let reloaded = FailedMessageStore::load(path.clone()).await.unwrap();
        assert_eq!(reloaded.len().await, 1);
        let drained = reloaded.drain().await.unwrap();
        assert_eq!(drained[0].0, "did:plc:alice::rev1");
        assert_eq!(drained[0].1.body, vec![1, 2, 3]);
        assert_eq!(reloaded.len().await, 0);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn remove_deletes_entry() {
        let path = temp_path("failed-remove");
        let store = FailedMessageStore::load(path.clone()).await.unwrap();
        store
            .insert(
                "k",
                FailedMessage {
                    kind: "#handle".to_string(),
                    body: vec![],
                    retries: 2,
                },
            )
            .await
            .unwrap();
        store.remove("k").await.unwrap();
        assert_eq!(store.len().await, 0);

        let reloaded = FailedMessageStore::load(path.clone()).await.unwrap();
        assert_eq!(reloaded.len().await, 0);
        let _ = tokio::fs::remove_file(&path).await;
    }
}
