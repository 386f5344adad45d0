//! 上传目标 (folder, filename) 的解析与路径穿越防护。

use std::fmt;
use std::path::{Component, Path};

use crate::error::UploadError;

/// A sanitized `(folder, filename)` pair an artifact is persisted under.
///
/// Both parts come from untrusted input (token claims and the multipart file
/// name), so construction rejects anything that could leave the backend root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDestination {
    folder: Vec<String>,
    filename: String,
}

impl StorageDestination {
    pub fn new(folder: &str, filename: &str) -> Result<Self, UploadError> {
        Ok(Self {
            folder: sanitize_folder(folder)?,
            filename: sanitize_filename(filename)?,
        })
    }

    /// 规范化后的目录，以 `/` 连接。
    pub fn folder(&self) -> String {
        self.folder.join("/")
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// 依次返回目录各段与文件名。
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.folder
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.filename.as_str()))
    }
}

impl fmt::Display for StorageDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.folder(), self.filename)
    }
}

/// 将目录拆分为安全的普通路径段。
pub fn sanitize_folder(folder: &str) -> Result<Vec<String>, UploadError> {
    let normalized = folder.replace('\\', "/");
    let trimmed = normalized.trim().trim_start_matches('/');
    let mut segments = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(segment) => {
                let segment = segment
                    .to_str()
                    .ok_or_else(|| UploadError::protocol("folder is not valid UTF-8"))?;
                check_segment(segment, "folder")?;
                segments.push(segment.to_string());
            }
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(UploadError::protocol("folder escapes the storage root"));
            }
        }
    }
    if segments.is_empty() {
        return Err(UploadError::protocol("folder is required"));
    }
    Ok(segments)
}

fn sanitize_filename(filename: &str) -> Result<String, UploadError> {
    let filename = filename.trim();
    if filename.is_empty() {
        return Err(UploadError::protocol("filename is required"));
    }
    if filename.contains(['/', '\\']) {
        return Err(UploadError::protocol("filename must not contain separators"));
    }
    if filename == "." || filename == ".." {
        return Err(UploadError::protocol("filename escapes the storage root"));
    }
    check_segment(filename, "filename")?;
    Ok(filename.to_string())
}

fn check_segment(segment: &str, what: &str) -> Result<(), UploadError> {
    if segment.chars().any(char::is_control) {
        return Err(UploadError::Protocol(format!(
            "{what} contains control characters"
        )));
    }
    Ok(())
}
