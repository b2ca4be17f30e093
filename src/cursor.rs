use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// A stale cursor would make the relay replay days of history; past this age
// we reconnect live instead.
const CURSOR_TTL: Duration = Duration::from_secs(72 * 3600);

// Writes are coalesced: handlers are idempotent, so losing the last few
// seconds of cursor on a crash only costs reprocessing.
const FLUSH_DELAY: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize, Deserialize)]
struct CursorRecord {
    cursor: i64,
    updated_at: DateTime<Utc>,
}

struct CursorState {
    cursor: Option<i64>,
    dirty: bool,
}

/// Durable store for the last processed firehose sequence number. Kept in
/// memory and flushed to a single JSON file on a delay.
pub struct CursorStore {
    path: PathBuf,
    state: Mutex<CursorState>,
}

impl CursorStore {
    pub async fn load(path: PathBuf) -> Result<Self> {
        let cursor = match tokio::fs::read(&path).await {
            Ok(data) => match serde_json::from_slice::<CursorRecord>(&data) {
                Ok(record) => {
                    let age = Utc::now().signed_duration_since(record.updated_at);
                    if age.to_std().map(|a| a > CURSOR_TTL).unwrap_or(false) {
                        warn!(
                            cursor = record.cursor,
                            "Persisted cursor is older than {} hours, starting live",
                            CURSOR_TTL.as_secs() / 3600
                        );
                        None
                    } else {
                        info!(cursor = record.cursor, "Loaded persisted cursor");
                        Some(record.cursor)
                    }
                }
                Err(e) => {
                    warn!("Ignoring unreadable cursor file {}: {}", path.display(), e);
                    None
                }
            },
            Err(_) => None,
        };

        Ok(Self {
            path,
            state: Mutex::new(CursorState {
                cursor,
                dirty: false,
            }),
        })
    }

    pub async fn get(&self) -> Option<i64> {
        self.state.lock().await.cursor
    }

    /// Record a processed sequence number. Monotonic: an older sequence is
    /// ignored, so overlapping commit tasks can report out of order.
    pub async fn advance(&self, seq: i64) {
        let mut state = self.state.lock().await;
        if state.cursor.map(|current| seq > current).unwrap_or(true) {
            state.cursor = Some(seq);
            state.dirty = true;
        }
    }

    pub async fn flush(&self) -> Result<()> {
        let cursor = {
            let mut state = self.state.lock().await;
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            match state.cursor {
                Some(cursor) => cursor,
                None => return Ok(()),
            }
        };

        let record = CursorRecord {
            cursor,
            updated_at: Utc::now(),
        };
        let data = serde_json::to_vec(&record)?;
        tokio::fs::write(&self.path, data)
            .await
            .with_context(|| format!("Failed to write cursor file {}", self.path.display()))?;
        debug!(cursor, "Flushed cursor");

        Ok(())
    }

    /// Background flusher; runs until the task is aborted.
    pub async fn run_flusher(&self) {
        let mut interval = tokio::time::interval(FLUSH_DELAY);
        loop {
            interval.tick().await;
            if let Err(e) = self.flush().await {
                warn!("Cursor flush failed: {}", e);
            }
        }
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
    async fn advance_is_monotonic() {
        let store = CursorStore::load(temp_path("cursor-monotonic")).await.unwrap();
        store.advance(10).await;
        store.advance(5).await;
        assert_eq!(store.get().await, Some(10));
        store.advance(11).await;
        assert_eq!(store.get().await, Some(11));
    }

    #[tokio::test]
    async fn flush_and_reload_roundtrip() {
        let path = temp_path("cursor-roundtrip");
        let store = CursorStore::load(path.clone()).await.unwrap();
        store.advance(99).await;
        store.flush().await.unwrap();

        let reloaded = CursorStore::load(path.clone()).await.unwrap();
        assert_eq!(reloaded.get().await, Some(99));
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn expired_cursor_is_discarded() {
        let path = temp_path("cursor-expired");
        let record = CursorRecord {
            cursor: 7,
            updated_at: Utc::now() - chrono::Duration::days(4),
        };
        tokio::fs::write(&path, serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();

        let store = CursorStore::load(path.clone()).await.unwrap();
        assert_eq!(store.get().await, None);
        let _ = tokio::fs::remove_file(&path).await;
    }
}
