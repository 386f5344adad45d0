//! 内嵌上传页面。

use axum::http::{HeaderValue, Uri, header};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;

use crate::error::ApiError;

#[derive(RustEmbed)]
#[folder = "frontend"]
/// 上传页面静态资源。
pub struct FrontendAssets;

/// 静态资源回退处理器；未知的无扩展名路径返回上传页面。
pub async fn serve_frontend(uri: Uri) -> Result<Response, ApiError> {
    let path = uri.path().trim_start_matches('/');
    let requested = if path.is_empty() { "index.html" } else { path };
    if let Some(response) = load_embedded_asset(requested)? {
        return Ok(response);
    }

    if !requested.contains('.')
        && !requested.starts_with("api/")
        && let Some(response) = load_embedded_asset("index.html")?
    {
        return Ok(response);
    }

    Err(ApiError::NotFound("not found".into()))
}

fn load_embedded_asset(path: &str) -> Result<Option<Response>, ApiError> {
    let Some(asset) = FrontendAssets::get(path) else {
        return Ok(None);
    };
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let content_type = HeaderValue::from_str(mime.essence_str())
        .map_err(|_| ApiError::Internal("invalid mime type".into()))?;
    Ok(Some(
        ([(header::CONTENT_TYPE, content_type)], asset.data.into_owned()).into_response(),
    ))
}
