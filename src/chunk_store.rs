//! 分片暂存：每个上传 ID 一个目录，每个分片一个文件。
//!
//! Layout under the scratch root:
//!
//! ```text
//! <root>/<upload-id>/meta.json    manifest (total count + destination)
//! <root>/<upload-id>/007.part     chunk 7, zero-padded to the width of the total
//! <root>/<upload-id>/artifact     assembled file, present only after assembly
//! <root>/<upload-id>.done          completion marker, kept until swept by age
//! ```
//!
//! Temporary files are dot-prefixed and never end in `.part`, so a crash in the
//! middle of a write never shows up in [`ChunkStore::list_indices`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::atomic::{AtomicFile, sync_dir};
use crate::error::UploadError;

const MANIFEST_NAME: &str = "meta.json";
const ARTIFACT_NAME: &str = "artifact";
const CHUNK_SUFFIX: &str = ".part";
const COMPLETED_SUFFIX: &str = ".done";

/// 上传的持久化描述，由第一个分片建立。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadManifest {
    pub total_count: u64,
    pub folder: String,
    pub filename: String,
}

#[derive(Debug)]
pub struct ChunkStore {
    root: PathBuf,
    max_chunk_size: u64,
}

impl ChunkStore {
    pub fn new(root: PathBuf, max_chunk_size: u64) -> Self {
        Self {
            root,
            max_chunk_size,
        }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 返回上传 ID 对应的暂存目录。
    pub fn upload_dir(&self, upload_id: &Uuid) -> PathBuf {
        self.root.join(upload_id.to_string())
    }

    pub fn artifact_path(&self, upload_id: &Uuid) -> PathBuf {
        self.upload_dir(upload_id).join(ARTIFACT_NAME)
    }

    fn completion_marker_path(&self, upload_id: &Uuid) -> PathBuf {
        self.root.join(format!("{upload_id}{COMPLETED_SUFFIX}"))
    }

    fn manifest_path(&self, upload_id: &Uuid) -> PathBuf {
        self.upload_dir(upload_id).join(MANIFEST_NAME)
    }

    fn chunk_path(&self, upload_id: &Uuid, index: u64, total_count: u64) -> PathBuf {
        self.upload_dir(upload_id)
            .join(chunk_file_name(index, total_count))
    }

    /// 写入清单；已存在时校验一致，不一致视为协议错误。
    ///
    /// 先写临时文件再硬链接到位，并发的首个分片只会看到同一份完整清单。
    pub async fn establish_manifest(
        &self,
        upload_id: &Uuid,
        manifest: &UploadManifest,
    ) -> Result<(), UploadError> {
        let dir = self.upload_dir(upload_id);
        fs::create_dir_all(&dir).await?;
        let manifest_path = self.manifest_path(upload_id);

        if let Some(existing) = self.read_manifest(upload_id).await? {
            return check_manifest(&existing, manifest);
        }

        let content = serde_json::to_vec(manifest).map_err(io::Error::other)?;
        let temp_path = dir.join(format!(".{MANIFEST_NAME}.tmp.{}", Uuid::new_v4()));
        let mut file = File::create(&temp_path).await?;
        let written = async {
            file.write_all(&content).await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }

        let linked = fs::hard_link(&temp_path, &manifest_path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => {
                sync_dir(&dir).await?;
                debug!(
                    %upload_id,
                    total_count = manifest.total_count,
                    "upload manifest created"
                );
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                match self.read_manifest(upload_id).await? {
                    Some(existing) => check_manifest(&existing, manifest),
                    None => Err(UploadError::Io(err)),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// 读取清单；上传不存在时返回 `None`。
    pub async fn read_manifest(
        &self,
        upload_id: &Uuid,
    ) -> Result<Option<UploadManifest>, UploadError> {
        let bytes = match fs::read(self.manifest_path(upload_id)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let manifest = serde_json::from_slice(&bytes).map_err(io::Error::other)?;
        Ok(Some(manifest))
    }

    /// 持久化一个分片；同一索引重复写入会整体覆盖。返回写入字节数。
    pub async fn write_chunk<R>(
        &self,
        upload_id: &Uuid,
        index: u64,
        total_count: u64,
        data: R,
    ) -> Result<u64, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        if index >= total_count {
            return Err(UploadError::Protocol(format!(
                "chunk index {index} out of range for {total_count} chunks"
            )));
        }

        let dir = self.upload_dir(upload_id);
        fs::create_dir_all(&dir).await?;
        let chunk_path = self.chunk_path(upload_id, index, total_count);

        let mut atomic = AtomicFile::new(&chunk_path).await?;
        let mut limited = data.take(self.max_chunk_size.saturating_add(1));
        let written = match tokio::io::copy(&mut limited, atomic.file_mut()).await {
            Ok(written) => written,
            Err(err) => {
                atomic.cleanup().await;
                return Err(err.into());
            }
        };
        if written > self.max_chunk_size {
            atomic.cleanup().await;
            return Err(UploadError::protocol("chunk too large"));
        }
        atomic.finalize().await?;

        debug!(%upload_id, index, total_count, bytes = written, "chunk saved");
        Ok(written)
    }

    /// 列出已持久化的分片索引；未知上传返回空集合。
    pub async fn list_indices(&self, upload_id: &Uuid) -> Result<BTreeSet<u64>, UploadError> {
        let mut indices = BTreeSet::new();
        let mut dir = match fs::read_dir(self.upload_dir(upload_id)).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(indices),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(index) = parse_chunk_file_name(&file_name) {
                indices.insert(index);
            }
        }
        Ok(indices)
    }

    /// 打开单个分片用于组装。
    pub async fn read_chunk(
        &self,
        upload_id: &Uuid,
        index: u64,
        total_count: u64,
    ) -> Result<File, UploadError> {
        match File::open(self.chunk_path(upload_id, index, total_count)).await {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(UploadError::NotFound {
                upload_id: *upload_id,
                index,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// 记录上传已转存完成；标记位于上传目录之外，`cleanup` 不会删除它。
    pub async fn mark_completed(&self, upload_id: &Uuid) -> Result<(), UploadError> {
        fs::create_dir_all(&self.root).await?;
        let atomic = AtomicFile::new(&self.completion_marker_path(upload_id)).await?;
        atomic.finalize().await?;
        Ok(())
    }

    /// 上传是否已经转存完成。
    pub async fn is_completed(&self, upload_id: &Uuid) -> Result<bool, UploadError> {
        match fs::metadata(self.completion_marker_path(upload_id)).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// 删除上传的全部暂存状态；可重复调用，未知 ID 为空操作。
    pub async fn cleanup(&self, upload_id: &Uuid) -> Result<(), UploadError> {
        match fs::remove_dir_all(self.upload_dir(upload_id)).await {
            Ok(()) => {
                debug!(%upload_id, "scratch state removed");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// 清理过期的上传暂存目录与完成标记，返回删除数量。`ttl` 为 0 时不清理。
    pub async fn sweep_stale(&self, ttl: Duration) -> io::Result<usize> {
        if ttl.is_zero() {
            return Ok(0);
        }

        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let metadata = entry.metadata().await?;
            let is_upload_dir = metadata.is_dir() && Uuid::parse_str(&name).is_ok();
            let is_marker = metadata.is_file()
                && name
                    .strip_suffix(COMPLETED_SUFFIX)
                    .is_some_and(|id| Uuid::parse_str(id).is_ok());
            if !is_upload_dir && !is_marker {
                continue;
            }
            let age = match metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
            {
                Some(age) => age,
                None => continue,
            };
            if age >= ttl {
                let path = entry.path();
                let result = if is_upload_dir {
                    fs::remove_dir_all(&path).await
                } else {
                    fs::remove_file(&path).await
                };
                if let Err(err) = result {
                    warn!(path = ?path, error = %err, "failed to remove stale scratch entry");
                } else {
                    info!(path = ?path, age_secs = age.as_secs(), "removed stale scratch entry");
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }
}

fn check_manifest(existing: &UploadManifest, incoming: &UploadManifest) -> Result<(), UploadError> {
    if existing.total_count != incoming.total_count {
        return Err(UploadError::Protocol(format!(
            "total chunk count {} does not match {} declared by earlier chunks",
            incoming.total_count, existing.total_count
        )));
    }
    if existing.folder != incoming.folder || existing.filename != incoming.filename {
        return Err(UploadError::protocol(
            "chunk destination differs from earlier chunks",
        ));
    }
    Ok(())
}

/// 分片文件名按总数位宽补零，使字典序与索引顺序一致。
fn chunk_file_name(index: u64, total_count: u64) -> String {
    let width = total_count.to_string().len();
    format!("{index:0width$}{CHUNK_SUFFIX}")
}

fn parse_chunk_file_name(name: &str) -> Option<u64> {
    let digits = name.strip_suffix(CHUNK_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MAX_CHUNK: u64 = 1024;

    fn make_store() -> (tempfile::TempDir, ChunkStore) {
        let temp = tempdir().expect("tempdir");
        let store = ChunkStore::new(temp.path().join("uploader"), MAX_CHUNK);
        (temp, store)
    }

    fn manifest(total_count: u64) -> UploadManifest {
        UploadManifest {
            total_count,
            folder: "team".into(),
            filename: "report.pdf".into(),
        }
    }

    async fn read_all(mut file: File) -> Vec<u8> {
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.expect("read chunk");
        buf
    }

    #[test]
    fn chunk_names_sort_like_indices() {
        assert_eq!(chunk_file_name(7, 120), "007.part");
        assert_eq!(chunk_file_name(0, 9), "0.part");
        assert_eq!(chunk_file_name(9, 10), "09.part");
        assert_eq!(parse_chunk_file_name("007.part"), Some(7));
        assert_eq!(parse_chunk_file_name(".007.part.tmp.x"), None);
        assert_eq!(parse_chunk_file_name("meta.json"), None);
        assert_eq!(parse_chunk_file_name("+1.part"), None);
    }

    #[tokio::test]
    async fn duplicate_write_is_idempotent() {
        let (_temp, store) = make_store();
        let upload_id = Uuid::new_v4();

        store
            .write_chunk(&upload_id, 1, 3, &b"same"[..])
            .await
            .expect("first write");
        let after_first = store.list_indices(&upload_id).await.expect("list");
        store
            .write_chunk(&upload_id, 1, 3, &b"same"[..])
            .await
            .expect("second write");

        assert_eq!(store.list_indices(&upload_id).await.expect("list"), after_first);
        assert_eq!(after_first, BTreeSet::from([1]));
        let file = store.read_chunk(&upload_id, 1, 3).await.expect("read");
        assert_eq!(read_all(file).await, b"same");
    }

    #[tokio::test]
    async fn retry_overwrites_instead_of_appending() {
        let (_temp, store) = make_store();
        let upload_id = Uuid::new_v4();

        store
            .write_chunk(&upload_id, 0, 2, &b"first attempt"[..])
            .await
            .expect("first write");
        store
            .write_chunk(&upload_id, 0, 2, &b"retry"[..])
            .await
            .expect("retry");

        let file = store.read_chunk(&upload_id, 0, 2).await.expect("read");
        assert_eq!(read_all(file).await, b"retry");
    }

    #[tokio::test]
    async fn scratch_layout_is_zero_padded() {
        let (_temp, store) = make_store();
        let upload_id = Uuid::new_v4();
        store
            .write_chunk(&upload_id, 3, 12, &b"x"[..])
            .await
            .expect("write");

        let path = store.upload_dir(&upload_id).join("03.part");
        assert!(fs::metadata(&path).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_index_out_of_range() {
        let (_temp, store) = make_store();
        let result = store
            .write_chunk(&Uuid::new_v4(), 3, 3, &b"x"[..])
            .await;
        assert!(matches!(result, Err(UploadError::Protocol(_))));
    }

    #[tokio::test]
    async fn rejects_oversized_chunk_without_leaving_files() {
        let (_temp, store) = make_store();
        let upload_id = Uuid::new_v4();
        let data = vec![0u8; MAX_CHUNK as usize + 1];

        let result = store.write_chunk(&upload_id, 0, 1, &data[..]).await;
        assert!(matches!(result, Err(UploadError::Protocol(_))));

        let mut dir = fs::read_dir(store.upload_dir(&upload_id))
            .await
            .expect("read dir");
        assert!(dir.next_entry().await.expect("entry").is_none());
    }

    #[tokio::test]
    async fn read_missing_chunk_is_not_found() {
        let (_temp, store) = make_store();
        let upload_id = Uuid::new_v4();
        let result = store.read_chunk(&upload_id, 0, 1).await;
        assert!(matches!(
            result,
            Err(UploadError::NotFound { index: 0, .. })
        ));
    }

    #[tokio::test]
    async fn list_unknown_upload_is_empty() {
        let (_temp, store) = make_store();
        let indices = store.list_indices(&Uuid::new_v4()).await.expect("list");
        assert!(indices.is_empty());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let (_temp, store) = make_store();
        let upload_id = Uuid::new_v4();

        store.cleanup(&Uuid::new_v4()).await.expect("unknown id");

        store
            .write_chunk(&upload_id, 0, 1, &b"x"[..])
            .await
            .expect("write");
        store.cleanup(&upload_id).await.expect("first cleanup");
        store.cleanup(&upload_id).await.expect("second cleanup");
        assert!(fs::metadata(store.upload_dir(&upload_id)).await.is_err());
    }

    #[tokio::test]
    async fn manifest_first_writer_wins() {
        let (_temp, store) = make_store();
        let upload_id = Uuid::new_v4();

        store
            .establish_manifest(&upload_id, &manifest(3))
            .await
            .expect("create");
        store
            .establish_manifest(&upload_id, &manifest(3))
            .await
            .expect("same manifest again");

        let mismatch = store.establish_manifest(&upload_id, &manifest(4)).await;
        assert!(matches!(mismatch, Err(UploadError::Protocol(_))));

        let mut other_file = manifest(3);
        other_file.filename = "other.pdf".into();
        let mismatch = store.establish_manifest(&upload_id, &other_file).await;
        assert!(matches!(mismatch, Err(UploadError::Protocol(_))));

        let stored = store.read_manifest(&upload_id).await.expect("read");
        assert_eq!(stored, Some(manifest(3)));
    }

    #[tokio::test]
    async fn concurrent_first_chunks_agree_on_manifest() {
        let (_temp, store) = make_store();
        let store = std::sync::Arc::new(store);
        let upload_id = Uuid::new_v4();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.establish_manifest(&upload_id, &manifest(5)).await })
            })
            .collect();
        for task in tasks {
            task.await.expect("join").expect("establish");
        }
        assert_eq!(
            store.read_manifest(&upload_id).await.expect("read"),
            Some(manifest(5))
        );
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_upload_dirs() {
        let (_temp, store) = make_store();
        let upload_id = Uuid::new_v4();
        store
            .write_chunk(&upload_id, 0, 2, &b"x"[..])
            .await
            .expect("write");
        let finished = Uuid::new_v4();
        store.mark_completed(&finished).await.expect("mark");
        let unrelated = store.root_path().join("not-an-upload");
        fs::create_dir_all(&unrelated).await.expect("unrelated dir");

        assert_eq!(store.sweep_stale(Duration::ZERO).await.expect("disabled"), 0);
        assert_eq!(
            store
                .sweep_stale(Duration::from_secs(3600))
                .await
                .expect("fresh"),
            0
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        let removed = store
            .sweep_stale(Duration::from_millis(10))
            .await
            .expect("sweep");
        assert_eq!(removed, 2);
        assert!(fs::metadata(store.upload_dir(&upload_id)).await.is_err());
        assert!(!store.is_completed(&finished).await.expect("marker"));
        assert!(fs::metadata(&unrelated).await.is_ok());
    }

    #[tokio::test]
    async fn completion_marker_survives_cleanup() {
        let (_temp, store) = make_store();
        let upload_id = Uuid::new_v4();
        store
            .write_chunk(&upload_id, 0, 1, &b"x"[..])
            .await
            .expect("write");
        assert!(!store.is_completed(&upload_id).await.expect("before"));

        store.mark_completed(&upload_id).await.expect("mark");
        store.cleanup(&upload_id).await.expect("cleanup");

        assert!(store.is_completed(&upload_id).await.expect("after"));
        assert!(fs::metadata(store.upload_dir(&upload_id)).await.is_err());
        assert!(!store.is_completed(&Uuid::new_v4()).await.expect("unknown"));
    }
}
