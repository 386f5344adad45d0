//! 后台任务：清理过期的分片暂存目录与空闲的上传锁。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SCRATCH_SWEEP_INTERVAL_SECS;
use crate::coordinator::UploadCoordinator;

/// 启动后台清理任务；`ttl` 为零时只清理锁表。
pub fn spawn_background_tasks(coordinator: Arc<UploadCoordinator>, ttl: Duration) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(SCRATCH_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            run_sweep(&coordinator, ttl).await;
        }
    });
}

async fn run_sweep(coordinator: &UploadCoordinator, ttl: Duration) {
    match coordinator.chunk_store().sweep_stale(ttl).await {
        Ok(0) => {}
        Ok(removed) => info!(removed, "removed abandoned uploads"),
        Err(err) => warn!(error = %err, "scratch sweep failed"),
    }
    let pruned = coordinator.prune_idle_locks().await;
    if pruned > 0 {
        debug!(pruned, "pruned idle upload locks");
    }
}
