//! Uploaded file handling: type detection, text extraction, archive unpacking.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::DocumentError;
use crate::splitter::SourceDocument;

/// File kinds recognized by extension (case-insensitive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Text,
    Markdown,
    Csv,
    Zip,
}

impl DocumentKind {
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let ext = path.as_ref().extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(Self::Pdf),
            "txt" => Some(Self::Text),
            "md" => Some(Self::Markdown),
            "csv" => Some(Self::Csv),
            "zip" => Some(Self::Zip),
            _ => None,
        }
    }

    /// Kinds whose text can be extracted and ingested.
    pub fn is_text_bearing(self) -> bool {
        matches!(self, Self::Pdf | Self::Text | Self::Markdown)
    }
}

/// Reduce an uploaded file name to a safe base name.
///
/// Directory components (either separator) are dropped, as are control
/// characters. An empty result becomes `upload`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Extract plain text from a PDF, text or markdown file.
pub async fn extract_text(path: &Path) -> Result<String, DocumentError> {
    match DocumentKind::from_path(path) {
        Some(DocumentKind::Pdf) => {
            let owned = path.to_path_buf();
            let result = tokio::task::spawn_blocking(move || pdf_extract::extract_text(&owned))
                .await
                .map_err(|e| DocumentError::Pdf {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?;
            result.map_err(|e| DocumentError::Pdf {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        }
        Some(DocumentKind::Text | DocumentKind::Markdown) => {
            let bytes = tokio::fs::read(path).await?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => Err(DocumentError::Unsupported {
            path: path.to_path_buf(),
        }),
    }
}

/// Extract a file into a document whose metadata names the file.
pub async fn load_document(path: &Path) -> Result<SourceDocument, DocumentError> {
    let text = extract_text(path).await?;
    let source = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    debug!(source = %source, chars = text.len(), "Extracted document text");
    Ok(SourceDocument::from_source(text, source))
}

/// Size caps applied while unpacking an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLimits {
    pub max_entry_bytes: u64,
    pub max_total_bytes: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_entry_bytes: 20 * 1024 * 1024,
            max_total_bytes: 200 * 1024 * 1024,
        }
    }
}

/// Unpack a zip archive into `dest`. Entries whose names would escape
/// `dest` are skipped. Returns the number of files written.
///
/// Sizes are counted from the bytes actually read, never from the sizes
/// the archive declares.
pub async fn unpack_zip(
    archive: &Path,
    dest: &Path,
    limits: ArchiveLimits,
) -> Result<usize, DocumentError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_zip_blocking(&archive, &dest, limits))
        .await
        .map_err(|e| DocumentError::Archive {
            message: e.to_string(),
        })?
}

fn unpack_zip_blocking(
    archive: &Path,
    dest: &Path,
    limits: ArchiveLimits,
) -> Result<usize, DocumentError> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| DocumentError::Archive {
        message: format!("Invalid zip archive: {e}"),
    })?;
    std::fs::create_dir_all(dest)?;

    let mut written = 0;
    let mut total: u64 = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| DocumentError::Archive {
            message: e.to_string(),
        })?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "Skipping archive entry with unsafe path");
            continue;
        };
        let out_path = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let budget = limits
            .max_entry_bytes
            .min(limits.max_total_bytes.saturating_sub(total));
        let mut out = std::fs::File::create(&out_path)?;
        let copied = std::io::copy(&mut (&mut entry).take(budget.saturating_add(1)), &mut out)?;
        if copied > budget {
            drop(out);
            std::fs::remove_file(&out_path)?;
            let message = if copied > limits.max_entry_bytes {
                format!(
                    "Entry '{}' exceeds the {} byte limit",
                    entry.name(),
                    limits.max_entry_bytes
                )
            } else {
                format!(
                    "Archive exceeds the {} byte total limit",
                    limits.max_total_bytes
                )
            };
            return Err(DocumentError::Archive { message });
        }
        total += copied;
        written += 1;
    }
    Ok(written)
}

/// Map lowercased file names to paths for every file under `root`.
///
/// When two files share a name the first one walked wins.
pub fn file_lookup(root: &Path) -> HashMap<String, PathBuf> {
    let mut lookup = HashMap::new();
    for entry in WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let key = entry.file_name().to_string_lossy().to_lowercase();
        lookup
            .entry(key)
            .or_insert_with(|| entry.path().to_path_buf());
    }
    lookup
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, body) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(DocumentKind::from_path("a.PDF"), Some(DocumentKind::Pdf));
        assert_eq!(DocumentKind::from_path("notes.md"), Some(DocumentKind::Markdown));
        assert_eq!(DocumentKind::from_path("x.csv"), Some(DocumentKind::Csv));
        assert_eq!(DocumentKind::from_path("r.zip"), Some(DocumentKind::Zip));
        assert_eq!(DocumentKind::from_path("image.png"), None);
        assert_eq!(DocumentKind::from_path("README"), None);
        assert!(DocumentKind::Text.is_text_bearing());
        assert!(!DocumentKind::Csv.is_text_bearing());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\cv.pdf"), "cv.pdf");
        assert_eq!(sanitize_filename("bad\nname.txt"), "badname.txt");
        assert_eq!(sanitize_filename(""), "upload");
        assert_eq!(sanitize_filename("dir/.."), "upload");
    }

    #[tokio::test]
    async fn test_extract_plain_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "line one\nline two").unwrap();
        assert_eq!(extract_text(&path).await.unwrap(), "line one\nline two");

        let doc = load_document(&path).await.unwrap();
        assert_eq!(doc.metadata["source"], "notes.txt");
    }

    #[tokio::test]
    async fn test_extract_unsupported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, "a,b").unwrap();
        assert!(matches!(
            extract_text(&path).await,
            Err(DocumentError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_extract_invalid_pdf_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, "not a pdf").unwrap();
        assert!(extract_text(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_unpack_zip_and_lookup() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("resumes.zip");
        write_zip(
            &archive,
            &[
                ("alice.txt", "Alice resume"),
                ("nested/Bob.TXT", "Bob resume"),
                ("../escape.txt", "nope"),
            ],
        );

        let dest = dir.path().join("resumes");
        let written = unpack_zip(&archive, &dest, ArchiveLimits::default())
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert!(!dir.path().join("escape.txt").exists());

        let lookup = file_lookup(&dest);
        assert!(lookup.contains_key("alice.txt"));
        assert_eq!(
            std::fs::read_to_string(&lookup["bob.txt"]).unwrap(),
            "Bob resume"
        );
    }

    #[tokio::test]
    async fn test_unpack_invalid_zip() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("bad.zip");
        std::fs::write(&archive, "garbage").unwrap();
        let err = unpack_zip(&archive, &dir.path().join("out"), ArchiveLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DocumentError::Archive { .. }));
    }

    /// Rewrite the uncompressed size of every central directory record.
    fn forge_declared_size(path: &Path, size: u32) {
        let mut bytes = std::fs::read(path).unwrap();
        let signature = [0x50, 0x4b, 0x01, 0x02];
        let offsets: Vec<usize> = bytes
            .windows(4)
            .enumerate()
            .filter(|(_, w)| *w == signature)
            .map(|(i, _)| i)
            .collect();
        assert!(!offsets.is_empty());
        for offset in offsets {
            bytes[offset + 24..offset + 28].copy_from_slice(&size.to_le_bytes());
        }
        std::fs::write(path, bytes).unwrap();
    }

    #[tokio::test]
    async fn test_unpack_ignores_declared_entry_size() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("forged.zip");
        let file = std::fs::File::create(&archive).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        zip.start_file("cv.txt", options).unwrap();
        zip.write_all(b"short resume").unwrap();
        zip.finish().unwrap();
        forge_declared_size(&archive, u32::MAX);

        let dest = dir.path().join("out");
        match unpack_zip(&archive, &dest, ArchiveLimits::default()).await {
            Ok(_) => {
                let body = std::fs::read_to_string(dest.join("cv.txt")).unwrap();
                assert_eq!(body, "short resume");
            }
            Err(e) => assert!(matches!(e, DocumentError::Archive { .. }), "{e}"),
        }
    }

    #[tokio::test]
    async fn test_unpack_rejects_oversized_entry() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("big.zip");
        let body = "x".repeat(100);
        write_zip(&archive, &[("big.txt", body.as_str())]);

        let dest = dir.path().join("out");
        let limits = ArchiveLimits {
            max_entry_bytes: 10,
            max_total_bytes: 1000,
        };
        let err = unpack_zip(&archive, &dest, limits).await.unwrap_err();
        match err {
            DocumentError::Archive { message } => assert!(message.contains("big.txt"), "{message}"),
            e => panic!("Expected Archive error, got: {e:?}"),
        }
        assert!(!dest.join("big.txt").exists());
    }

    #[tokio::test]
    async fn test_unpack_rejects_archive_over_total_limit() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("many.zip");
        write_zip(
            &archive,
            &[("a.txt", "12345678"), ("b.txt", "12345678"), ("c.txt", "1")],
        );

        let limits = ArchiveLimits {
            max_entry_bytes: 10,
            max_total_bytes: 12,
        };
        let err = unpack_zip(&archive, &dir.path().join("out"), limits)
            .await
            .unwrap_err();
        match err {
            DocumentError::Archive { message } => {
                assert!(message.contains("total limit"), "{message}")
            }
            e => panic!("Expected Archive error, got: {e:?}"),
        }
    }
}
