use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};

/// Compact once if at least `threshold` records were appended since the last
/// compaction. Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compaction skipped: {appends}/{threshold} appends");
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            warn!("compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventDraft;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("clashd_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn below_threshold_does_nothing() {
        let engine = Engine::new(test_wal_path("below.wal")).unwrap();
        engine.create_resource("Room A", "room").await.unwrap();
        assert!(!compact_if_needed(&engine, 10).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 1);
    }

    #[tokio::test]
    async fn at_threshold_compacts() {
        let path = test_wal_path("at_threshold.wal");
        let engine = Engine::new(path.clone()).unwrap();
        let r = engine.create_resource("Room A", "room").await.unwrap();
        for _ in 0..5 {
            let e = engine
                .create_event(EventDraft {
                    title: "tmp".into(),
                    start: 0,
                    end: 3_600_000,
                    resource_ids: vec![r.id],
                    ..Default::default()
                })
                .await
                .unwrap();
            engine.delete_event(e.id).await.unwrap();
        }

        assert!(compact_if_needed(&engine, 11).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(crate::wal::Wal::replay(&path).unwrap().len(), 1);
    }
}
