//! 按上传 ID 划分的内存锁：串行化同一上传的收尾阶段。

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// 以上传 ID 为键的异步互斥锁表。
///
/// 锁表本身只在克隆条目时持有，不同上传之间互不等待。
#[derive(Debug, Default)]
pub struct UploadLocks {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl UploadLocks {
    /// 创建新的锁管理器实例。
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 获取指定上传的互斥锁，持有期间其他同 ID 的收尾请求将等待。
    pub async fn lock(&self, upload_id: &Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(*upload_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// 移除无人持有也无人等待的锁条目，返回移除数量。
    pub async fn prune_idle(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn same_upload_is_serialized() {
        let locks = Arc::new(UploadLocks::new());
        let upload_id = Uuid::new_v4();
        let guard = locks.lock(&upload_id).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&upload_id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender acquires after release")
            .expect("join");
    }

    #[tokio::test]
    async fn different_uploads_do_not_contend() {
        let locks = UploadLocks::new();
        let _first = locks.lock(&Uuid::new_v4()).await;
        timeout(Duration::from_millis(100), locks.lock(&Uuid::new_v4()))
            .await
            .expect("unrelated upload must not wait");
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let locks = UploadLocks::new();
        let held = Uuid::new_v4();
        let _guard = locks.lock(&held).await;
        drop(locks.lock(&Uuid::new_v4()).await);

        assert_eq!(locks.prune_idle().await, 1);
        assert_eq!(locks.len().await, 1);
    }
}
