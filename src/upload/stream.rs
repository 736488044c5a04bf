//! Streaming multipart receiver.
//!
//! File parts are copied to disk in fixed-size pieces and the running total is
//! checked before each piece is written, so an oversized upload never puts
//! more than its cap on disk. Every file created for a request is tracked by a
//! [`PersistedFiles`] guard that removes them if the request fails or is dropped.

use axum::extract::Multipart;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{extension_of, UploadConfig, UploadError, UploadedFile, UploadedFiles};
use crate::body::FormValues;

const COPY_BUFFER_SIZE: usize = 32 * 1024;
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Deletes the tracked files on drop unless disarmed
#[derive(Debug, Default)]
pub struct PersistedFiles {
    paths: Vec<PathBuf>,
}

impl PersistedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    pub fn from_uploads(files: &UploadedFiles) -> Self {
        Self {
            paths: files.values().flatten().map(|f| f.path.clone()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Keep the files; ownership passes to the caller
    pub fn disarm(mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.paths)
    }
}

impl Drop for PersistedFiles {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!("Removed partial upload {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove upload {}: {}", path.display(), e),
            }
        }
    }
}

/// Consume a multipart body: files go to disk, scalar parts into form values.
///
/// `form_limit` bounds the total bytes held in memory for scalar parts.
pub async fn receive(
    multipart: &mut Multipart,
    config: &UploadConfig,
    form_limit: usize,
) -> Result<(UploadedFiles, FormValues), UploadError> {
    let mut persisted = PersistedFiles::new();
    let mut files = UploadedFiles::new();
    let mut form = FormValues::new();
    let mut form_bytes = 0usize;

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().filter(|f| !f.is_empty()).map(str::to_string);

        let Some(original_name) = file_name else {
            let value = read_scalar(&mut field, &mut form_bytes, form_limit).await?;
            form.entry(name).or_default().push(value);
            continue;
        };

        let extension = extension_of(&original_name).ok_or_else(|| UploadError::MissingExtension {
            field: name.clone(),
            filename: original_name.clone(),
        })?;

        match config.file_fields.get(&name) {
            Some(field_config) if !field_config.allows(&extension) => {
                return Err(UploadError::TypeNotAllowed {
                    field: name,
                    extension,
                    allowed: field_config.allowed_types.clone(),
                });
            }
            None if !config.file_fields.is_empty() => {
                return Err(UploadError::UnexpectedField { field: name });
            }
            _ => {}
        }

        let cap = config.effective_cap(&name, &extension);
        let stored_name = format!("{}.{}", Uuid::new_v4(), extension);
        let path = config.destination().join(&stored_name);
        let mime_type = field.content_type().unwrap_or(DEFAULT_MIME_TYPE).to_string();

        let mut file = tokio::fs::File::create(&path).await?;
        persisted.track(path.clone());

        let mut size: u64 = 0;
        while let Some(chunk) = field.chunk().await? {
            for piece in chunk.chunks(COPY_BUFFER_SIZE) {
                size += piece.len() as u64;
                if cap > 0 && size > cap {
                    tracing::debug!("Upload in field '{}' passed its {} byte cap", name, cap);
                    return Err(UploadError::TooLarge { field: name, limit: cap });
                }
                file.write_all(piece).await?;
            }
        }
        file.flush().await?;

        let temp_path = (!config.keep_files_after_send).then(|| path.clone());
        tracing::debug!("Stored upload '{}' as {} ({} bytes)", original_name, stored_name, size);
        files.entry(name.clone()).or_default().push(UploadedFile {
            field_name: name,
            original_name,
            stored_name,
            size,
            extension,
            mime_type,
            path,
            temp_path,
        });
    }

    for (field, field_config) in &config.file_fields {
        let count = files.get(field).map_or(0, Vec::len);
        if field_config.required && count == 0 {
            return Err(UploadError::MissingRequired { field: field.clone() });
        }
        if field_config.max_files > 0 && count > field_config.max_files {
            return Err(UploadError::TooManyFiles {
                field: field.clone(),
                max: field_config.max_files,
            });
        }
    }

    persisted.disarm();
    Ok((files, form))
}

/// Read a multipart body on an endpoint without uploads: scalar parts only,
/// bounded in memory; any file part is rejected
pub async fn scan_form_fields(multipart: &mut Multipart, form_limit: usize) -> Result<FormValues, UploadError> {
    let mut form = FormValues::new();
    let mut form_bytes = 0usize;

    while let Some(mut field) = multipart.next_field().await? {
        if field.file_name().is_some_and(|f| !f.is_empty()) {
            return Err(UploadError::NotConfigured);
        }
        let name = field.name().unwrap_or_default().to_string();
        let value = read_scalar(&mut field, &mut form_bytes, form_limit).await?;
        form.entry(name).or_default().push(value);
    }
    Ok(form)
}

async fn read_scalar(
    field: &mut axum::extract::multipart::Field<'_>,
    total: &mut usize,
    limit: usize,
) -> Result<String, UploadError> {
    let mut buf = Vec::new();
    while let Some(chunk) = field.chunk().await? {
        *total += chunk.len();
        if limit > 0 && *total > limit {
            return Err(UploadError::FormTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    String::from_utf8(buf).map_err(|_| UploadError::Multipart("form field is not valid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_removes_tracked_files_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"half").unwrap();

        let mut guard = PersistedFiles::new();
        guard.track(path.clone());
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn disarmed_guard_keeps_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kept.bin");
        std::fs::write(&path, b"whole").unwrap();

        let mut guard = PersistedFiles::new();
        guard.track(path.clone());
        assert_eq!(guard.disarm(), vec![path.clone()]);
        assert!(path.exists());
    }
}
