//! Retention manager for purging expired current snapshots.

use crate::db::Store;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Manager for deleting current slots past their TTL.
///
/// Reads already hide expired slots; this only reclaims the rows.
pub struct RetentionManager {
    store: Store,
    interval: Duration,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Store) -> Self {
        Self::with_interval(store, Duration::from_secs(60))
    }

    pub fn with_interval(store: Store, interval: Duration) -> Self {
        Self {
            store,
            interval,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
    pub async fn start(&self) {
        let (tx, mut rx) = tokio::sync::broadcast::channel(1);
        {
            let mut stop_guard = self.stop.lock().await;
            *stop_guard = Some(tx);
        }

        let store = self.store.clone();
        let period = self.interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        let store = store.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || process_retention(&store)).await {
                            tracing::error!("RetentionManager: purge task failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

fn process_retention(store: &Store) {
    match store.purge_expired_current(Utc::now().timestamp()) {
        Ok(0) => {}
        Ok(removed) => tracing::debug!("RetentionManager: Purged {} expired snapshots", removed),
        Err(e) => tracing::error!("RetentionManager: Failed to purge expired snapshots: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Snapshot, WriteOp};
    use serde_json::{json, Map};

    #[tokio::test]
    async fn test_purges_expired_rows() {
        let store = Store::open_in_memory().unwrap();
        let mut doc = Map::new();
        doc.insert("ts".to_string(), json!(1));
        store
            .apply(&[WriteOp::SetCurrent {
                snapshot: Snapshot::new(doc, "gone"),
                expires_at: 1,
            }])
            .unwrap();

        let manager = RetentionManager::with_interval(store.clone(), Duration::from_millis(10));
        manager.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.stop().await;

        assert_eq!(store.purge_expired_current(i64::MAX).unwrap(), 0);
    }
}
