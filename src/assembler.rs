//! 分片完整性判断与按索引顺序合并。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tracing::{debug, error};
use uuid::Uuid;

use crate::atomic::AtomicFile;
use crate::chunk_store::ChunkStore;
use crate::error::UploadError;

/// 暂存区中已组装完成的上传文件。
#[derive(Debug, Clone)]
pub struct Artifact {
    upload_id: Uuid,
    path: PathBuf,
    size: u64,
}

impl Artifact {
    pub fn upload_id(&self) -> &Uuid {
        &self.upload_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// 以只读方式打开组装结果。
    pub async fn open(&self) -> std::io::Result<File> {
        File::open(&self.path).await
    }
}

#[derive(Debug, Clone)]
pub struct Assembler {
    chunks: Arc<ChunkStore>,
}

impl Assembler {
    pub fn new(chunks: Arc<ChunkStore>) -> Self {
        Self { chunks }
    }

    /// 仅当已存索引恰好为 `0..total_count` 时返回 true。
    pub async fn is_complete(&self, upload_id: &Uuid, total_count: u64) -> Result<bool, UploadError> {
        let indices = self.chunks.list_indices(upload_id).await?;
        Ok(indices.len() as u64 == total_count && indices.iter().copied().eq(0..total_count))
    }

    /// 按索引升序合并全部分片到新的 artifact 文件。
    ///
    /// 对未完整的上传调用属于协调器缺陷，返回 [`UploadError::Incomplete`]。
    pub async fn assemble(&self, upload_id: &Uuid, total_count: u64) -> Result<Artifact, UploadError> {
        if !self.is_complete(upload_id, total_count).await? {
            let present = self.chunks.list_indices(upload_id).await?;
            let missing: Vec<u64> = (0..total_count)
                .filter(|index| !present.contains(index))
                .take(8)
                .collect();
            error!(
                %upload_id,
                total_count,
                present = present.len(),
                ?missing,
                "assemble called on incomplete upload"
            );
            return Err(UploadError::Incomplete {
                upload_id: *upload_id,
                detail: format!(
                    "{} of {total_count} chunks present, missing {missing:?}",
                    present.len()
                ),
            });
        }

        let target = self.chunks.artifact_path(upload_id);
        let mut atomic = AtomicFile::new(&target).await?;
        let written: Result<u64, UploadError> = async {
            let mut total_written = 0;
            for index in 0..total_count {
                let mut part = self.chunks.read_chunk(upload_id, index, total_count).await?;
                total_written += tokio::io::copy(&mut part, atomic.file_mut()).await?;
            }
            Ok(total_written)
        }
        .await;
        let size = match written {
            Ok(size) => size,
            Err(err) => {
                atomic.cleanup().await;
                return Err(err);
            }
        };
        atomic.finalize().await?;

        debug!(%upload_id, total_count, size, "upload assembled");
        Ok(Artifact {
            upload_id: *upload_id,
            path: target,
            size,
        })
    }

    /// 返回此前已组装完成的 artifact（若存在）。
    pub async fn existing_artifact(&self, upload_id: &Uuid) -> Result<Option<Artifact>, UploadError> {
        let path = self.chunks.artifact_path(upload_id);
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(Artifact {
                upload_id: *upload_id,
                path,
                size: metadata.len(),
            })),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_assembler() -> (tempfile::TempDir, Arc<ChunkStore>, Assembler) {
        let temp = tempdir().expect("tempdir");
        let chunks = Arc::new(ChunkStore::new(temp.path().join("uploader"), 1024));
        let assembler = Assembler::new(chunks.clone());
        (temp, chunks, assembler)
    }

    async fn put(chunks: &ChunkStore, upload_id: &Uuid, index: u64, total: u64, data: &[u8]) {
        chunks
            .write_chunk(upload_id, index, total, data)
            .await
            .expect("write chunk");
    }

    #[tokio::test]
    async fn completeness_requires_exact_range() {
        let (_temp, chunks, assembler) = make_assembler();
        let upload_id = Uuid::new_v4();

        put(&chunks, &upload_id, 0, 3, b"a").await;
        put(&chunks, &upload_id, 2, 3, b"c").await;
        assert!(!assembler.is_complete(&upload_id, 3).await.expect("check"));

        put(&chunks, &upload_id, 1, 3, b"b").await;
        assert!(assembler.is_complete(&upload_id, 3).await.expect("check"));

        // An index beyond the declared total must not count as complete.
        put(&chunks, &upload_id, 3, 4, b"d").await;
        assert!(!assembler.is_complete(&upload_id, 3).await.expect("check"));
    }

    #[tokio::test]
    async fn assembles_in_index_order_not_arrival_order() {
        let (_temp, chunks, assembler) = make_assembler();
        let upload_id = Uuid::new_v4();

        put(&chunks, &upload_id, 2, 3, b"C").await;
        put(&chunks, &upload_id, 0, 3, b"A").await;
        put(&chunks, &upload_id, 1, 3, b"B").await;

        let artifact = assembler.assemble(&upload_id, 3).await.expect("assemble");
        assert_eq!(artifact.size(), 3);
        assert_eq!(fs::read(artifact.path()).await.expect("read"), b"ABC");
        assert_ne!(artifact.path(), chunks.upload_dir(&upload_id).join("0.part"));
    }

    #[tokio::test]
    async fn assemble_incomplete_fails_loudly() {
        let (_temp, chunks, assembler) = make_assembler();
        let upload_id = Uuid::new_v4();
        put(&chunks, &upload_id, 0, 2, b"A").await;

        let result = assembler.assemble(&upload_id, 2).await;
        assert!(matches!(result, Err(UploadError::Incomplete { .. })));
        assert!(assembler
            .existing_artifact(&upload_id)
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn existing_artifact_survives_until_cleanup() {
        let (_temp, chunks, assembler) = make_assembler();
        let upload_id = Uuid::new_v4();
        put(&chunks, &upload_id, 0, 1, b"only").await;

        assembler.assemble(&upload_id, 1).await.expect("assemble");
        let existing = assembler
            .existing_artifact(&upload_id)
            .await
            .expect("lookup")
            .expect("artifact present");
        assert_eq!(existing.size(), 4);
        assert_eq!(existing.upload_id(), &upload_id);

        chunks.cleanup(&upload_id).await.expect("cleanup");
        assert!(assembler
            .existing_artifact(&upload_id)
            .await
            .expect("lookup")
            .is_none());
    }
}
