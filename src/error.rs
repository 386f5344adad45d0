//! 统一的错误类型与 HTTP 响应转换。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::io;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::auth::AuthError;

/// 分片存储、组装、存储后端与协调器的错误。
#[derive(Debug, Error)]
pub enum UploadError {
    /// 客户端发送的分片元数据无效或前后不一致。
    #[error("protocol error: {0}")]
    Protocol(String),

    /// 对尚未完整的上传请求组装。
    #[error("upload {upload_id} is incomplete: {detail}")]
    Incomplete { upload_id: Uuid, detail: String },

    /// 完整性检查之后分片丢失。
    #[error("chunk {index} of upload {upload_id} not found")]
    NotFound { upload_id: Uuid, index: u64 },

    #[error("storage sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl UploadError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        UploadError::Protocol(msg.into())
    }

    /// 是否属于组装不变量被破坏（协调器缺陷）。
    pub fn is_invariant_breach(&self) -> bool {
        matches!(
            self,
            UploadError::Incomplete { .. } | UploadError::NotFound { .. }
        )
    }
}

pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
    ServiceUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, msg).into_response()
            }
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        if err.is_invariant_breach() {
            error!(error = %err, "assembly invariant violated");
            return ApiError::Internal("Cannot save the file.".into());
        }
        match err {
            UploadError::Protocol(msg) => ApiError::BadRequest(msg),
            UploadError::SinkUnavailable(msg) => {
                error!(error = %msg, "storage backend failed");
                ApiError::ServiceUnavailable("Cannot save the file.".into())
            }
            other => {
                error!(error = %other, "upload failed");
                ApiError::Internal("Cannot save the file.".into())
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Expired => ApiError::Unauthorized("Token expired.".into()),
            AuthError::Unauthorized => {
                ApiError::Unauthorized("Something is wrong with your token.".into())
            }
            AuthError::Signing(msg) => {
                error!(error = %msg, "token signing failed");
                ApiError::Internal("Cannot issue token.".into())
            }
        }
    }
}
