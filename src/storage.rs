//! 最终存储后端：本地目录树或对象存储。

use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::assembler::Artifact;
use crate::atomic::AtomicFile;
use crate::config::{ConfigError, StorageConfig};
use crate::destination::StorageDestination;
use crate::error::UploadError;

/// 把组装完成的 artifact 放到最终位置。
///
/// 成功后可在 `destination` 读取到完整内容；失败时目标位置不会出现任何部分数据。
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// 用于日志的后端描述。
    fn describe(&self) -> String;

    async fn store(
        &self,
        artifact: &Artifact,
        destination: &StorageDestination,
    ) -> Result<(), UploadError>;
}

/// 根据启动配置构建唯一的存储后端。
pub async fn build_backend(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>, ConfigError> {
    match config {
        StorageConfig::Local { root } => {
            let backend = LocalBackend::new(root.clone());
            backend.ensure_root().await.map_err(ConfigError::LocalRoot)?;
            Ok(Arc::new(backend))
        }
        StorageConfig::ObjectStore { url } => Ok(Arc::new(ObjectSinkBackend::from_url(url)?)),
    }
}

#[derive(Clone, Debug)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 解析目标路径，并拒绝经过符号链接或非目录的中间路径。
    pub async fn resolve(&self, destination: &StorageDestination) -> Result<PathBuf, UploadError> {
        let mut current = self.root.clone();
        let mut segments = destination.segments().peekable();

        while let Some(segment) = segments.next() {
            current.push(segment);
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(UploadError::Protocol(format!(
                            "destination {destination} passes through a symlink"
                        )));
                    }
                    if segments.peek().is_some() && !metadata.is_dir() {
                        return Err(UploadError::Protocol(format!(
                            "destination {destination} passes through a file"
                        )));
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    for rest in segments {
                        current.push(rest);
                    }
                    return Ok(current);
                }
                Err(err) => return Err(sink_error(&current, err)),
            }
        }

        Ok(current)
    }
}

fn sink_error(path: &Path, err: io::Error) -> UploadError {
    UploadError::SinkUnavailable(format!("{}: {err}", path.display()))
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn describe(&self) -> String {
        format!("local:{}", self.root_path().display())
    }

    async fn store(
        &self,
        artifact: &Artifact,
        destination: &StorageDestination,
    ) -> Result<(), UploadError> {
        let target = self.resolve(destination).await?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| sink_error(parent, err))?;
        }

        let mut source = artifact.open().await?;
        let mut atomic = AtomicFile::new(&target)
            .await
            .map_err(|err| sink_error(&target, err))?;
        if let Err(err) = tokio::io::copy(&mut source, atomic.file_mut()).await {
            atomic.cleanup().await;
            return Err(sink_error(&target, err));
        }
        atomic
            .finalize()
            .await
            .map_err(|err| sink_error(&target, err))?;

        info!(
            upload_id = %artifact.upload_id(),
            path = ?target,
            size = artifact.size(),
            "artifact stored on local filesystem"
        );
        Ok(())
    }
}

/// 把 artifact 流式写入对象存储，键为 `prefix/folder/filename`。
#[derive(Debug, Clone)]
pub struct ObjectSinkBackend {
    store: Arc<dyn ObjectStore>,
    prefix: ObjectPath,
    label: String,
}

impl ObjectSinkBackend {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: ObjectPath, label: impl Into<String>) -> Self {
        Self {
            store,
            prefix,
            label: label.into(),
        }
    }

    /// 解析 `gs://bucket/prefix` 或 `s3://bucket/prefix`，凭据取自环境变量。
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| ConfigError::InvalidObjectStoreUrl(url.to_string()))?;
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(ConfigError::InvalidObjectStoreUrl(url.to_string()));
        }
        let prefix = ObjectPath::parse(prefix.trim_matches('/'))
            .map_err(|err| ConfigError::InvalidObjectStoreUrl(format!("{url}: {err}")))?;

        let store: Arc<dyn ObjectStore> = match scheme {
            "gs" => Arc::new(
                GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(bucket)
                    .build()?,
            ),
            "s3" => Arc::new(AmazonS3Builder::from_env().with_bucket_name(bucket).build()?),
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };
        Ok(Self::new(store, prefix, format!("{scheme}://{bucket}")))
    }

    fn sink_error(&self, key: &ObjectPath, err: io::Error) -> UploadError {
        UploadError::SinkUnavailable(format!("{}/{key}: {err}", self.label))
    }

    /// 由目标生成对象键。
    pub fn key(&self, destination: &StorageDestination) -> ObjectPath {
        destination
            .segments()
            .fold(self.prefix.clone(), |key, segment| key.child(segment))
    }
}

#[async_trait]
impl StorageBackend for ObjectSinkBackend {
    fn describe(&self) -> String {
        format!("{}/{}", self.label, self.prefix)
    }

    async fn store(
        &self,
        artifact: &Artifact,
        destination: &StorageDestination,
    ) -> Result<(), UploadError> {
        let key = self.key(destination);
        let content_type = mime_guess::from_path(destination.filename()).first_or_octet_stream();
        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::ContentType,
            content_type.essence_str().to_string().into(),
        );

        debug!(
            upload_id = %artifact.upload_id(),
            key = %key,
            content_type = content_type.essence_str(),
            "uploading artifact to object store"
        );
        let mut source = artifact.open().await?;
        let mut writer =
            BufWriter::new(Arc::clone(&self.store), key.clone()).with_attributes(attributes);

        if let Err(err) = tokio::io::copy(&mut source, &mut writer).await {
            let _ = writer.abort().await;
            return Err(self.sink_error(&key, err));
        }
        // shutdown 失败后写入器已进入完成状态，不能再 abort。
        if let Err(err) = writer.shutdown().await {
            return Err(self.sink_error(&key, err));
        }

        info!(
            upload_id = %artifact.upload_id(),
            store = %self.label,
            key = %key,
            size = artifact.size(),
            "artifact stored in object store"
        );
        Ok(())
    }
}
