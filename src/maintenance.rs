use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::{Engine, now_ms};
use crate::model::Ms;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const SYNC_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Compact the WAL once it has grown past `threshold` appends.
/// Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!(appends, "WAL compacted");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that periodically compacts the WAL.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

/// Report stale calendar connections. Returns how many are stale.
pub async fn check_sync_health(engine: &Engine, now: Ms, stale_after: Ms) -> usize {
    let stale = engine.stale_connections(now, stale_after).await;
    metrics::gauge!(crate::observability::STALE_CONNECTIONS).set(stale.len() as f64);
    metrics::gauge!(crate::observability::HOSTS_ACTIVE).set(engine.host_count() as f64);
    for conn in &stale {
        warn!(
            host = %conn.host_id,
            connection = %conn.connection_id,
            provider = %conn.provider,
            status = conn.sync_status.as_str(),
            last_synced_at = ?conn.last_synced_at,
            "calendar connection is stale; availability uses the last snapshot"
        );
    }
    stale.len()
}

/// Background task that periodically surfaces calendar staleness.
pub async fn run_sync_monitor(engine: Arc<Engine>, stale_after: Ms) {
    let mut interval = tokio::time::interval(SYNC_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        check_sync_health(&engine, now_ms(), stale_after).await;
        engine.notify.prune();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::busy::SyncCache;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_maintenance");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn engine(name: &str) -> Engine {
        Engine::new(test_wal_path(name), Arc::new(NotifyHub::new()), Arc::new(SyncCache::new())).unwrap()
    }

    async fn host(engine: &Engine) -> Ulid {
        let id = Ulid::new();
        engine
            .upsert_host(Host {
                id,
                name: None,
                timezone: "UTC".into(),
                default_buffers: Buffers::default(),
            })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn compactor_waits_for_threshold() {
        let engine = engine("compactor_threshold.wal");
        host(&engine).await;
        host(&engine).await;

        assert!(!compact_if_needed(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 2);

        host(&engine).await;
        assert!(compact_if_needed(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.host_count(), 3);
    }

    #[tokio::test]
    async fn sync_monitor_counts_stale_connections() {
        let engine = engine("sync_monitor.wal");
        let host_id = host(&engine).await;
        let now = 100 * HOUR;

        let fresh = Ulid::new();
        let failing = Ulid::new();
        for id in [fresh, failing] {
            engine
                .upsert_connection(CalendarConnection {
                    id,
                    host_id,
                    provider: "google".into(),
                    sync_status: SyncStatus::Unknown,
                    last_synced_at: None,
                })
                .await
                .unwrap();
        }
        engine.record_sync(fresh, SyncOutcome::Synced { at: now - MINUTE }).await.unwrap();
        engine.record_sync(failing, SyncOutcome::Synced { at: now - 2 * HOUR }).await.unwrap();
        engine.record_sync(failing, SyncOutcome::Failed { at: now }).await.unwrap();

        assert_eq!(check_sync_health(&engine, now, HOUR).await, 1);
        assert_eq!(check_sync_health(&engine, now + 2 * HOUR, HOUR).await, 2);
    }
}
