//! Multipart request bodies, spooled into a per-request temp dir.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use axum::extract::Multipart;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::error::ApiError;
use crate::documents::sanitize_filename;

/// An uploaded file written to disk under its sanitized name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    pub name: String,
    pub path: PathBuf,
}

/// Text fields and saved files of one multipart request.
///
/// The temp dir, and every file in it, is removed when the form is dropped.
#[derive(Debug)]
pub struct UploadForm {
    dir: TempDir,
    fields: HashMap<String, String>,
    files: Vec<SavedFile>,
}

impl UploadForm {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            dir: tempfile::Builder::new().prefix("dbeb_").tempdir()?,
            fields: HashMap::new(),
            files: Vec::new(),
        })
    }

    /// Drain a multipart body. Parts with a file name are saved; the rest
    /// are kept as text fields.
    pub async fn from_multipart(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = Self::new().map_err(|e| ApiError::internal(e.to_string()))?;
        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::new(e.status(), e.body_text()))?
        {
            let field_name = field.name().unwrap_or_default().to_string();
            match field.file_name().map(str::to_string) {
                Some(file_name) if !file_name.is_empty() => {
                    let name = sanitize_filename(&file_name);
                    let path = form.dir.path().join(&name);
                    let mut out = tokio::fs::File::create(&path)
                        .await
                        .map_err(|e| ApiError::internal(format!("Failed to save file: {e}")))?;
                    while let Some(chunk) = field
                        .chunk()
                        .await
                        .map_err(|e| ApiError::new(e.status(), e.body_text()))?
                    {
                        out.write_all(&chunk)
                            .await
                            .map_err(|e| ApiError::internal(format!("Failed to save file: {e}")))?;
                    }
                    out.flush()
                        .await
                        .map_err(|e| ApiError::internal(format!("Failed to save file: {e}")))?;
                    debug!(field = %field_name, file = %name, "Saved upload");
                    form.files.push(SavedFile { name, path });
                }
                Some(_) => {}
                None => {
                    let value = field
                        .text()
                        .await
                        .map_err(|e| ApiError::new(e.status(), e.body_text()))?;
                    form.fields.insert(field_name, value);
                }
            }
        }
        Ok(form)
    }

    /// Write `bytes` as a file of this form.
    pub async fn save_file(&mut self, name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
        let name = sanitize_filename(name);
        let path = self.dir.path().join(&name);
        tokio::fs::write(&path, bytes).await?;
        self.files.push(SavedFile {
            name,
            path: path.clone(),
        });
        Ok(path)
    }

    pub fn insert_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    /// A text field, treating blank values as absent.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn files(&self) -> &[SavedFile] {
        &self.files
    }

    pub fn file_names(&self) -> Vec<String> {
        self.files.iter().map(|f| f.name.clone()).collect()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_files_removed_on_drop() {
        let mut form = UploadForm::new().unwrap();
        let path = form.save_file("../notes.txt", b"hello").await.unwrap();
        assert_eq!(form.file_names(), vec!["notes.txt".to_string()]);
        assert!(path.starts_with(form.dir()));
        assert!(path.exists());

        let dir = form.dir().to_path_buf();
        drop(form);
        assert!(!dir.exists());
    }

    #[test]
    fn test_blank_fields_are_absent() {
        let mut form = UploadForm::new().unwrap();
        form.insert_field("thread_id", "  ");
        form.insert_field("message", "hi");
        assert_eq!(form.field("thread_id"), None);
        assert_eq!(form.field("message"), Some("hi"));
    }
}
