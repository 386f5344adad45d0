//! 上传令牌：签发与校验（HS256 JWT，携带目标目录与过期时间）。

use axum::extract::{Extension, Form};
use axum::response::Json as JsonResponse;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::MAX_TOKEN_TTL_SECS;
use crate::destination::sanitize_folder;
use crate::error::ApiError;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token is invalid")]
    Unauthorized,

    #[error("token has expired")]
    Expired,

    #[error("cannot sign token: {0}")]
    Signing(String),
}

/// Claims carried by an upload token.
#[derive(Debug, Serialize, Deserialize)]
struct UploadClaims {
    exp: i64,
    folder: String,
}

/// Issues and verifies the capability tokens that authorize uploads.
pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    admin_secret: String,
}

impl TokenAuthority {
    pub fn new(jwt_secret: &str, admin_secret: String) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);
        Self {
            encoding: EncodingKey::from_secret(jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(jwt_secret.as_bytes()),
            validation,
            admin_secret,
        }
    }

    /// 签发在 `ttl` 后过期、授权写入 `folder` 的令牌。
    pub fn issue(&self, folder: &str, ttl: Duration) -> Result<String, AuthError> {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let exp = Utc::now().timestamp().saturating_add(ttl);
        self.sign(folder, exp)
    }

    fn sign(&self, folder: &str, exp: i64) -> Result<String, AuthError> {
        let claims = UploadClaims {
            exp,
            folder: folder.to_string(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| AuthError::Signing(err.to_string()))
    }

    /// 校验令牌并返回其授权的目录（仍需作为不可信输入进行清洗）。
    pub fn authorize(&self, token: &str) -> Result<String, AuthError> {
        match decode::<UploadClaims>(token.trim(), &self.decoding, &self.validation) {
            Ok(data) => Ok(data.claims.folder),
            Err(err) => match err.kind() {
                JwtErrorKind::ExpiredSignature => Err(AuthError::Expired),
                _ => {
                    warn!(error = %err, "rejected upload token");
                    Err(AuthError::Unauthorized)
                }
            },
        }
    }

    /// 常量时间比较管理员口令。
    pub fn verify_admin(&self, password: &str) -> bool {
        constant_time_eq(password.as_bytes(), self.admin_secret.as_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Deserialize)]
pub(crate) struct TokenRequest {
    password: String,
    duration: u64,
    folder: String,
}

#[derive(Serialize)]
pub(crate) struct TokenResponse {
    token: String,
}

/// 管理员签发上传令牌。
pub async fn issue_token(
    Extension(authority): Extension<Arc<TokenAuthority>>,
    Form(payload): Form<TokenRequest>,
) -> Result<JsonResponse<TokenResponse>, ApiError> {
    if !authority.verify_admin(&payload.password) {
        warn!("token request with wrong admin secret");
        return Err(ApiError::Unauthorized("unauthorized".into()));
    }
    if payload.duration == 0 || payload.duration > MAX_TOKEN_TTL_SECS {
        return Err(ApiError::BadRequest("duration is out of range".into()));
    }
    let folder = sanitize_folder(&payload.folder)?.join("/");

    let token = authority.issue(&folder, Duration::from_secs(payload.duration))?;
    info!(folder, duration_secs = payload.duration, "upload token issued");
    Ok(JsonResponse(TokenResponse { token }))
}
