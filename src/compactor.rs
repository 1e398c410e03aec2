use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::observability::WAL_COMPACTIONS_TOTAL;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact once the WAL has grown by `threshold` appends. Returns whether it ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that periodically compacts the WAL.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RestaurantSettings;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tablebook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();

        let owner = Ulid::new();
        let rid = Ulid::new();
        let settings = RestaurantSettings {
            max_reservation_minutes: 120,
            reservation_deposit: None,
        };
        engine
            .register_restaurant(rid, owner, "Trattoria".into(), settings)
            .await
            .unwrap();
        for table_id in 1..=5 {
            engine.add_table(rid, owner, table_id, 4).await.unwrap();
        }
        for table_id in 1..=4 {
            engine.remove_table(rid, owner, table_id).await.unwrap();
        }
        assert_eq!(engine.wal_appends_since_compact().await, 10);

        assert!(!compact_if_needed(&engine, 11).await);
        assert!(compact_if_needed(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        drop(engine);
        let reopened = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
        let tables = reopened.list_tables(rid).await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].table_id, 5);
    }
}
