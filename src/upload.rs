//! 分片上传 HTTP 处理器。
//!
//! Clients send one `multipart/form-data` request per chunk using Dropzone's
//! field names. Metadata fields must precede the `file` part so the chunk can
//! be streamed straight into scratch storage without buffering.

use axum::extract::multipart::{Field, Multipart};
use axum::extract::{Extension, Form};
use axum::http::StatusCode;
use futures_util::TryStreamExt;
use serde::Deserialize;
use std::io;
use std::sync::Arc;
use tokio_util::io::StreamReader;
use tracing::debug;
use uuid::{Uuid, Version};

use crate::auth::TokenAuthority;
use crate::coordinator::{UploadCoordinator, UploadStatus};
use crate::error::ApiError;

#[derive(Default)]
struct ChunkFields {
    token: Option<String>,
    upload_id: Option<Uuid>,
    index: Option<u64>,
    total_count: Option<u64>,
}

impl ChunkFields {
    async fn read_text(field: Field<'_>) -> Result<String, ApiError> {
        field
            .text()
            .await
            .map_err(|err| ApiError::BadRequest(err.body_text()))
    }

    fn require(&self) -> Result<(&str, Uuid, u64, u64), ApiError> {
        let missing = |name: &str| ApiError::BadRequest(format!("{name} is required before file"));
        Ok((
            self.token.as_deref().ok_or_else(|| missing("token"))?,
            self.upload_id.ok_or_else(|| missing("dzuuid"))?,
            self.index.ok_or_else(|| missing("dzchunkindex"))?,
            self.total_count.ok_or_else(|| missing("dztotalchunkcount"))?,
        ))
    }
}

/// 解析客户端生成的上传 ID，要求为 UUID v4。
pub fn parse_upload_id(value: &str) -> Result<Uuid, ApiError> {
    let upload_id = Uuid::parse_str(value.trim())
        .map_err(|_| ApiError::BadRequest("dzuuid is invalid".into()))?;
    if upload_id.get_version() != Some(Version::Random) {
        return Err(ApiError::BadRequest("dzuuid must be a UUID v4".into()));
    }
    Ok(upload_id)
}

fn parse_number(name: &str, value: &str) -> Result<u64, ApiError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ApiError::BadRequest(format!("{name} is invalid")))
}

/// 上传单个分片。
pub async fn upload_chunk(
    Extension(coordinator): Extension<Arc<UploadCoordinator>>,
    Extension(authority): Extension<Arc<TokenAuthority>>,
    mut multipart: Multipart,
) -> Result<StatusCode, ApiError> {
    let mut fields = ChunkFields::default();
    let mut status = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "token" => fields.token = Some(ChunkFields::read_text(field).await?),
            "dzuuid" => {
                fields.upload_id = Some(parse_upload_id(&ChunkFields::read_text(field).await?)?)
            }
            "dzchunkindex" => {
                fields.index = Some(parse_number(
                    "dzchunkindex",
                    &ChunkFields::read_text(field).await?,
                )?)
            }
            "dztotalchunkcount" => {
                fields.total_count = Some(parse_number(
                    "dztotalchunkcount",
                    &ChunkFields::read_text(field).await?,
                )?)
            }
            "file" => {
                if status.is_some() {
                    return Err(ApiError::BadRequest("only one file per request".into()));
                }
                let (token, upload_id, index, total_count) = fields.require()?;
                let folder = authority.authorize(token)?;
                let filename = field
                    .file_name()
                    .map(str::to_owned)
                    .ok_or_else(|| ApiError::BadRequest("file name is required".into()))?;

                let reader = StreamReader::new(field.map_err(|err| io::Error::other(err.to_string())));
                tokio::pin!(reader);
                let outcome = coordinator
                    .handle_chunk(upload_id, index, total_count, &folder, &filename, reader)
                    .await?;
                debug!(%upload_id, index, total_count, ?outcome, "chunk handled");
                status = Some(outcome);
            }
            _ => {}
        }
    }

    match status {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(ApiError::BadRequest("file is required".into())),
    }
}

#[derive(Deserialize)]
pub(crate) struct CompleteRequest {
    token: String,
    dzuuid: String,
}

/// 重试此前转存失败的上传，复用已暂存的分片。
///
/// 仍缺分片时返回 `409 Conflict`，客户端需先补发分片。
pub async fn complete_upload(
    Extension(coordinator): Extension<Arc<UploadCoordinator>>,
    Extension(authority): Extension<Arc<TokenAuthority>>,
    Form(payload): Form<CompleteRequest>,
) -> Result<StatusCode, ApiError> {
    let folder = authority.authorize(&payload.token)?;
    let upload_id = parse_upload_id(&payload.dzuuid)?;
    let outcome = coordinator.retry_completion(upload_id, &folder).await?;
    debug!(%upload_id, ?outcome, "completion retried");
    match outcome {
        UploadStatus::Pending => Err(ApiError::Conflict("upload is incomplete".into())),
        UploadStatus::Completed | UploadStatus::AlreadyCompleted => Ok(StatusCode::NO_CONTENT),
    }
}
