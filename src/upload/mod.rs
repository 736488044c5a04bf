//! Multipart file uploads: per-endpoint configuration, persisted file
//! descriptors and the errors the receiver can produce.

pub mod cleanup;
pub mod stream;

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use cleanup::{attach_cleanup, CleanupGuard};
pub use stream::{receive, scan_form_fields, PersistedFiles};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("file in field '{field}' exceeds the maximum size of {limit} bytes")]
    TooLarge { field: String, limit: u64 },

    #[error("form fields exceed the in-memory limit of {limit} bytes")]
    FormTooLarge { limit: usize },

    #[error("file '{filename}' in field '{field}' has no extension")]
    MissingExtension { field: String, filename: String },

    #[error("file type '.{extension}' is not allowed for field '{field}'; allowed: {}", allowed.join(", "))]
    TypeNotAllowed {
        field: String,
        extension: String,
        allowed: Vec<String>,
    },

    #[error("field '{field}' does not accept files")]
    UnexpectedField { field: String },

    #[error("field '{field}' requires a file")]
    MissingRequired { field: String },

    #[error("field '{field}' accepts at most {max} file(s)")]
    TooManyFiles { field: String, max: usize },

    #[error("this endpoint does not accept file uploads")]
    NotConfigured,

    #[error("malformed multipart body: {0}")]
    Multipart(String),

    #[error("upload storage error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// Field the error is about, for field-keyed details
    pub fn field(&self) -> Option<&str> {
        match self {
            UploadError::TooLarge { field, .. }
            | UploadError::MissingExtension { field, .. }
            | UploadError::TypeNotAllowed { field, .. }
            | UploadError::UnexpectedField { field }
            | UploadError::MissingRequired { field }
            | UploadError::TooManyFiles { field, .. } => Some(field),
            _ => None,
        }
    }
}

impl From<axum::extract::multipart::MultipartError> for UploadError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        UploadError::Multipart(err.body_text())
    }
}

/// Rules for one file field
#[derive(Debug, Clone, Default)]
pub struct FileFieldConfig {
    pub required: bool,
    /// Bytes; 0 defers to the endpoint-wide caps
    pub max_file_size: u64,
    /// Lowercase extensions without the dot; empty allows any
    pub allowed_types: Vec<String>,
    /// 0 means unlimited
    pub max_files: usize,
    pub type_size_limits: HashMap<String, u64>,
}

impl FileFieldConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn allowed_types<'a, I>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.allowed_types = extensions.into_iter().map(normalize_extension).collect();
        self
    }

    pub fn max_files(mut self, max: usize) -> Self {
        self.max_files = max;
        self
    }

    pub fn type_size_limit(mut self, extension: &str, bytes: u64) -> Self {
        self.type_size_limits.insert(normalize_extension(extension), bytes);
        self
    }

    pub fn allows(&self, extension: &str) -> bool {
        self.allowed_types.is_empty() || self.allowed_types.iter().any(|t| t == extension)
    }
}

/// Per-endpoint upload configuration
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Bytes per file; 0 is unbounded
    pub max_file_size: u64,
    pub type_size_limits: HashMap<String, u64>,
    /// When empty, any field may carry files under the endpoint-wide caps
    pub file_fields: HashMap<String, FileFieldConfig>,
    pub upload_path: PathBuf,
    pub temp_path: PathBuf,
    pub keep_files_after_send: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        let temp = std::env::temp_dir().join("declarest-uploads");
        Self {
            max_file_size: 0,
            type_size_limits: HashMap::new(),
            file_fields: HashMap::new(),
            upload_path: PathBuf::from("uploads"),
            temp_path: temp,
            keep_files_after_send: false,
        }
    }
}

impl UploadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn type_size_limit(mut self, extension: &str, bytes: u64) -> Self {
        self.type_size_limits.insert(normalize_extension(extension), bytes);
        self
    }

    pub fn file_field(mut self, name: &str, field: FileFieldConfig) -> Self {
        self.file_fields.insert(name.to_string(), field);
        self
    }

    pub fn upload_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.upload_path = path.into();
        self
    }

    pub fn temp_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.temp_path = path.into();
        self
    }

    pub fn keep_files_after_send(mut self, keep: bool) -> Self {
        self.keep_files_after_send = keep;
        self
    }

    /// Where new files are written: the temp dir when they are cleaned up after the response
    pub fn destination(&self) -> &Path {
        if self.keep_files_after_send {
            &self.upload_path
        } else {
            &self.temp_path
        }
    }

    /// Size cap for a file, most specific first: field type limit, field max,
    /// endpoint type limit, endpoint max. 0 means unbounded.
    pub fn effective_cap(&self, field: &str, extension: &str) -> u64 {
        if let Some(field_config) = self.file_fields.get(field) {
            if let Some(limit) = field_config.type_size_limits.get(extension) {
                return *limit;
            }
            if field_config.max_file_size > 0 {
                return field_config.max_file_size;
            }
        }
        if let Some(limit) = self.type_size_limits.get(extension) {
            return *limit;
        }
        self.max_file_size
    }

    /// Create the destination directories
    pub fn prepare(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.destination())
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Lowercased extension of a client file name, without the dot
pub fn extension_of(filename: &str) -> Option<String> {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// A persisted upload
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub field_name: String,
    pub original_name: String,
    pub stored_name: String,
    pub size: u64,
    pub extension: String,
    pub mime_type: String,
    pub path: PathBuf,
    /// Set when the file lives in the temp dir and is deleted after the response
    pub temp_path: Option<PathBuf>,
}

/// Field name -> files in arrival order
pub type UploadedFiles = BTreeMap<String, Vec<UploadedFile>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_priority_is_most_specific_first() {
        let config = UploadConfig::new()
            .max_file_size(100)
            .type_size_limit("png", 200)
            .file_field("avatar", FileFieldConfig::new().max_file_size(300).type_size_limit("gif", 400))
            .file_field("doc", FileFieldConfig::new());

        assert_eq!(config.effective_cap("avatar", "gif"), 400);
        assert_eq!(config.effective_cap("avatar", "png"), 300);
        assert_eq!(config.effective_cap("doc", "png"), 200);
        assert_eq!(config.effective_cap("doc", "txt"), 100);
        assert_eq!(config.effective_cap("other", "txt"), 100);
    }

    #[test]
    fn extensions_are_lowercased() {
        assert_eq!(extension_of("Photo.JPG").as_deref(), Some("jpg"));
        assert_eq!(extension_of("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(extension_of("C:\\docs\\cv.PDF").as_deref(), Some("pdf"));
        assert_eq!(extension_of("README"), None);
        assert_eq!(extension_of(".bashrc"), None);
        assert_eq!(extension_of("trailing."), None);
    }

    #[test]
    fn allowed_types_ignore_dots_and_case() {
        let field = FileFieldConfig::new().allowed_types([".PNG", "jpg"]);
        assert!(field.allows("png"));
        assert!(field.allows("jpg"));
        assert!(!field.allows("gif"));
        assert!(FileFieldConfig::new().allows("anything"));
    }

    #[test]
    fn destination_follows_cleanup_policy() {
        let config = UploadConfig::new().upload_path("/srv/up").temp_path("/tmp/up");
        assert_eq!(config.destination(), Path::new("/tmp/up"));
        assert_eq!(config.keep_files_after_send(true).destination(), Path::new("/srv/up"));
    }
}
