//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;
use std::path::PathBuf;
use thiserror::Error;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const SCRATCH_DIR_NAME: &str = "uploader";
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_MAX_CHUNKS: u64 = 8192;
pub const DEFAULT_TEMP_TTL_SECS: u64 = 24 * 60 * 60;
pub const SCRATCH_SWEEP_INTERVAL_SECS: u64 = 900;
pub const MAX_TOKEN_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "upldr", version = VERSION_INFO, about = "Chunked upload drop box")]
pub struct Args {
    #[arg(long, env = "UPLDR_ADMIN_SECRET", help = "Password required to issue upload tokens")]
    pub admin_secret: String,
    #[arg(
        long,
        env = "UPLDR_JWT_SECRET",
        help = "Secret used to sign upload tokens (random per process when unset)"
    )]
    pub jwt_secret: Option<String>,
    #[arg(long, env = "UPLDR_LOCAL_PATH", help = "Store finished uploads under this directory")]
    pub local_path: Option<PathBuf>,
    #[arg(
        long,
        env = "UPLDR_OBJECT_STORE_URL",
        help = "Store finished uploads in an object store (gs://bucket/prefix or s3://bucket/prefix)"
    )]
    pub object_store_url: Option<String>,
    #[arg(
        long,
        env = "UPLDR_TEMP_PATH",
        default_value = "/tmp",
        help = "Directory for in-flight chunks"
    )]
    pub temp_path: PathBuf,
    #[arg(
        short = 'b',
        long,
        env = "UPLDR_HOST",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "UPLDR_PORT",
        default_value_t = 8000,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        short = 'P',
        long,
        env = "UPLDR_HTTPS_PORT",
        default_value_t = 8443,
        help = "HTTPS port (used only with --tls-cert and --tls-key)"
    )]
    pub https_port: u16,
    #[arg(short = 'c', long, env = "UPLDR_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<PathBuf>,
    #[arg(short = 'k', long, env = "UPLDR_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<PathBuf>,
    #[arg(long, env = "UPLDR_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "UPLDR_MAX_CHUNK_SIZE",
        default_value_t = DEFAULT_MAX_CHUNK_SIZE,
        help = "Max size of a single chunk in bytes"
    )]
    pub max_chunk_size: u64,
    #[arg(
        long,
        env = "UPLDR_MAX_CHUNKS",
        default_value_t = DEFAULT_MAX_CHUNKS,
        help = "Max chunks per upload (0 to disable)"
    )]
    pub max_chunks: u64,
    #[arg(
        long,
        env = "UPLDR_TEMP_TTL_SECS",
        default_value_t = DEFAULT_TEMP_TTL_SECS,
        help = "Remove abandoned uploads older than this many seconds (0 to disable)"
    )]
    pub temp_ttl_secs: u64,
}

impl Args {
    /// 分片暂存根目录。
    pub fn scratch_root(&self) -> PathBuf {
        self.temp_path.join(SCRATCH_DIR_NAME)
    }

    pub fn storage_config(&self) -> Result<StorageConfig, ConfigError> {
        StorageConfig::select(self.local_path.clone(), self.object_store_url.clone())
    }

    /// 返回 TLS 证书与私钥路径；两者必须同时提供。
    pub fn tls_paths(&self) -> Result<Option<(PathBuf, PathBuf)>, ConfigError> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Ok(Some((cert.clone(), key.clone()))),
            (None, None) => Ok(None),
            _ => Err(ConfigError::IncompleteTls),
        }
    }
}

/// The one storage backend this process hands artifacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Local { root: PathBuf },
    ObjectStore { url: String },
}

impl StorageConfig {
    /// 恰好选择一个后端；都未配置或同时配置均为启动错误。
    pub fn select(
        local_path: Option<PathBuf>,
        object_store_url: Option<String>,
    ) -> Result<Self, ConfigError> {
        let object_store_url = object_store_url.filter(|url| !url.trim().is_empty());
        let local_path = local_path.filter(|path| !path.as_os_str().is_empty());
        match (local_path, object_store_url) {
            (Some(root), None) => Ok(StorageConfig::Local { root }),
            (None, Some(url)) => Ok(StorageConfig::ObjectStore { url }),
            (None, None) => Err(ConfigError::NoBackend),
            (Some(_), Some(_)) => Err(ConfigError::ConflictingBackends),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no storage backend configured: set --local-path or --object-store-url")]
    NoBackend,

    #[error("--local-path and --object-store-url are mutually exclusive")]
    ConflictingBackends,

    #[error("invalid object store url: {0}")]
    InvalidObjectStoreUrl(String),

    #[error("unsupported object store scheme: {0}")]
    UnsupportedScheme(String),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("cannot create local storage root: {0}")]
    LocalRoot(std::io::Error),

    #[error("--tls-cert and --tls-key must be given together")]
    IncompleteTls,
}
