//! 上传协调器：写入分片、检测完成并把结果交给存储后端。
//!
//! Completion runs under a per-upload lock held from the completeness check
//! through `store` and `cleanup`. That serializes only the tail of a single
//! upload; chunk writes and other uploads never wait on it. The lock is
//! process-local, so an upload identifier must be served by one process.
//!
//! A finished upload leaves a completion marker in the scratch root. Late
//! copies of its chunks see the marker and are answered with
//! [`UploadStatus::AlreadyCompleted`] instead of starting the upload again.

use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::assembler::{Artifact, Assembler};
use crate::chunk_store::{ChunkStore, UploadManifest};
use crate::destination::StorageDestination;
use crate::error::UploadError;
use crate::locking::UploadLocks;
use crate::storage::StorageBackend;

/// 单个分片的处理结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// 仍需更多分片。
    Pending,
    /// 本次调用完成了组装与转存。
    Completed,
    /// 其他请求已完成该上传，不会重复转存。
    AlreadyCompleted,
}

pub struct UploadCoordinator {
    chunks: Arc<ChunkStore>,
    assembler: Assembler,
    backend: Arc<dyn StorageBackend>,
    locks: UploadLocks,
    max_chunks: u64,
}

impl UploadCoordinator {
    pub fn new(chunks: Arc<ChunkStore>, backend: Arc<dyn StorageBackend>, max_chunks: u64) -> Self {
        Self {
            assembler: Assembler::new(chunks.clone()),
            chunks,
            backend,
            locks: UploadLocks::new(),
            max_chunks,
        }
    }

    pub fn chunk_store(&self) -> &Arc<ChunkStore> {
        &self.chunks
    }

    /// 处理一个分片；最后一个分片到达时完成组装与转存。
    pub async fn handle_chunk<R>(
        &self,
        upload_id: Uuid,
        index: u64,
        total_count: u64,
        folder: &str,
        filename: &str,
        data: R,
    ) -> Result<UploadStatus, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        if total_count == 0 {
            return Err(UploadError::protocol("total chunk count must be positive"));
        }
        if index >= total_count {
            return Err(UploadError::Protocol(format!(
                "chunk index {index} out of range for {total_count} chunks"
            )));
        }
        if self.max_chunks > 0 && total_count > self.max_chunks {
            return Err(UploadError::protocol("upload chunk count exceeds limit"));
        }
        let destination = StorageDestination::new(folder, filename)?;
        if self.chunks.is_completed(&upload_id).await? {
            debug!(%upload_id, index, "chunk for an upload that is already stored");
            return Ok(UploadStatus::AlreadyCompleted);
        }

        let manifest = UploadManifest {
            total_count,
            folder: destination.folder(),
            filename: destination.filename().to_string(),
        };
        self.chunks.establish_manifest(&upload_id, &manifest).await?;
        self.chunks
            .write_chunk(&upload_id, index, total_count, data)
            .await?;

        let _guard = self.locks.lock(&upload_id).await;
        if self.chunks.is_completed(&upload_id).await? {
            // 完成后才到达的重复分片重建了暂存目录，直接清除。
            self.chunks.cleanup(&upload_id).await?;
            debug!(%upload_id, index, "late chunk for a stored upload discarded");
            return Ok(UploadStatus::AlreadyCompleted);
        }
        if self.chunks.read_manifest(&upload_id).await?.is_none() {
            debug!(%upload_id, index, "upload already completed by another request");
            return Ok(UploadStatus::AlreadyCompleted);
        }
        if !self.assembler.is_complete(&upload_id, total_count).await? {
            return Ok(UploadStatus::Pending);
        }

        let artifact = self.assembler.assemble(&upload_id, total_count).await?;
        self.hand_off(&upload_id, &artifact, &destination).await?;
        Ok(UploadStatus::Completed)
    }

    /// 重新执行完成流程（用于此前转存失败的上传），无需重发分片。
    pub async fn retry_completion(
        &self,
        upload_id: Uuid,
        folder: &str,
    ) -> Result<UploadStatus, UploadError> {
        let _guard = self.locks.lock(&upload_id).await;
        if self.chunks.is_completed(&upload_id).await? {
            self.chunks.cleanup(&upload_id).await?;
            return Ok(UploadStatus::AlreadyCompleted);
        }
        let Some(manifest) = self.chunks.read_manifest(&upload_id).await? else {
            debug!(%upload_id, "retry for unknown or finished upload");
            return Ok(UploadStatus::AlreadyCompleted);
        };
        let destination = StorageDestination::new(&manifest.folder, &manifest.filename)?;
        let authorized = StorageDestination::new(folder, &manifest.filename)?;
        if authorized.folder() != destination.folder() {
            return Err(UploadError::protocol(
                "token folder does not match the upload",
            ));
        }

        let artifact = match self.assembler.existing_artifact(&upload_id).await? {
            Some(artifact) => artifact,
            None => {
                if !self
                    .assembler
                    .is_complete(&upload_id, manifest.total_count)
                    .await?
                {
                    return Ok(UploadStatus::Pending);
                }
                self.assembler
                    .assemble(&upload_id, manifest.total_count)
                    .await?
            }
        };
        self.hand_off(&upload_id, &artifact, &destination).await?;
        Ok(UploadStatus::Completed)
    }

    /// 清理空闲的锁条目。
    pub async fn prune_idle_locks(&self) -> usize {
        self.locks.prune_idle().await
    }

    async fn hand_off(
        &self,
        upload_id: &Uuid,
        artifact: &Artifact,
        destination: &StorageDestination,
    ) -> Result<(), UploadError> {
        if let Err(err) = self.backend.store(artifact, destination).await {
            error!(
                %upload_id,
                %destination,
                backend = %self.backend.describe(),
                artifact = %artifact.path().display(),
                error = %err,
                "hand-off failed, scratch state kept for retry"
            );
            return Err(err);
        }

        if let Err(err) = self.chunks.mark_completed(upload_id).await {
            error!(%upload_id, error = %err, "stored upload but failed to write completion marker");
        }
        if let Err(err) = self.chunks.cleanup(upload_id).await {
            warn!(%upload_id, error = %err, "stored upload but failed to remove scratch state");
        }
        info!(
            %upload_id,
            %destination,
            size = artifact.size(),
            backend = %self.backend.describe(),
            "upload complete"
        );
        Ok(())
    }
}
