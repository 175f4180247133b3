//! Fixed-window document splitting.
//!
//! Text is cut into windows of `chunk_size` characters; consecutive windows
//! share `chunk_overlap` characters. Offsets are in characters, not bytes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::IngestConfig;

/// Extracted text of one source file, before splitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub text: String,
    pub metadata: Map<String, Value>,
}

impl SourceDocument {
    /// A document tagged with its originating file name.
    pub fn from_source(text: impl Into<String>, source: impl Into<String>) -> Self {
        let mut metadata = Map::new();
        metadata.insert("source".to_string(), Value::String(source.into()));
        Self {
            text: text.into(),
            metadata,
        }
    }
}

/// A contiguous span of a document, ready to be embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: Uuid,
    pub text: String,
    pub chunk_index: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub metadata: Map<String, Value>,
}

impl DocumentChunk {
    /// Store payload in the `{page_content, metadata}` layout.
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "page_content": self.text,
            "metadata": Value::Object(self.metadata.clone()),
        })
    }
}

/// Character-window splitter with overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextSplitter {
    /// Overlap is clamped below the chunk size so every window advances.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Window boundaries `(start, end)` in characters for a text of `len` chars.
    fn windows(&self, len: usize) -> Vec<(usize, usize)> {
        let step = self.chunk_size - self.chunk_overlap;
        let mut out = Vec::new();
        let mut start = 0;
        while start < len {
            let end = (start + self.chunk_size).min(len);
            out.push((start, end));
            if end >= len {
                break;
            }
            start += step;
        }
        out
    }

    /// Split raw text into window strings. Blank input yields nothing.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        let chars: Vec<char> = text.chars().collect();
        self.windows(chars.len())
            .into_iter()
            .map(|(start, end)| chars[start..end].iter().collect())
            .collect()
    }

    /// Split a document, copying its metadata onto every chunk.
    pub fn split_document(&self, document: &SourceDocument) -> Vec<DocumentChunk> {
        if document.text.trim().is_empty() {
            return Vec::new();
        }
        let chars: Vec<char> = document.text.chars().collect();
        self.windows(chars.len())
            .into_iter()
            .enumerate()
            .map(|(chunk_index, (start, end))| DocumentChunk {
                id: Uuid::new_v4(),
                text: chars[start..end].iter().collect(),
                chunk_index,
                start_offset: start,
                end_offset: end,
                metadata: document.metadata.clone(),
            })
            .collect()
    }
}

impl Default for TextSplitter {
    fn default() -> Self {
        Self::from_config(&IngestConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected_count(n: usize, c: usize, o: usize) -> usize {
        (n - o).div_ceil(c - o)
    }

    #[test]
    fn test_chunk_count_matches_window_formula() {
        let splitter = TextSplitter::new(400, 200);
        for n in [401usize, 599, 600, 601, 1000, 1234, 5000] {
            let text = "x".repeat(n);
            assert_eq!(
                splitter.split_text(&text).len(),
                expected_count(n, 400, 200),
                "n={n}"
            );
        }
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        let splitter = TextSplitter::new(400, 200);
        assert_eq!(splitter.split_text("short text").len(), 1);
    }

    #[test]
    fn test_blank_text_yields_nothing() {
        let splitter = TextSplitter::default();
        assert!(splitter.split_text("").is_empty());
        assert!(splitter.split_text("   \n\t").is_empty());
    }

    #[test]
    fn test_adjacent_chunks_overlap() {
        let splitter = TextSplitter::new(10, 4);
        let text: String = ('a'..='z').collect();
        let chunks = splitter.split_text(&text);
        assert_eq!(chunks[0], "abcdefghij");
        assert_eq!(chunks[1], "ghijklmnop");
        assert_eq!(&chunks[0][6..], &chunks[1][..4]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
    }

    #[test]
    fn test_multibyte_text_is_split_on_char_boundaries() {
        let splitter = TextSplitter::new(3, 1);
        let chunks = splitter.split_text("héllo wörld");
        assert!(chunks.iter().all(|c| c.chars().count() <= 3));
        assert_eq!(chunks[0], "hél");
    }

    #[test]
    fn test_overlap_clamped_below_size() {
        let splitter = TextSplitter::new(5, 10);
        assert_eq!(splitter.chunk_overlap(), 4);
        // Still terminates and advances one char per window.
        assert_eq!(splitter.split_text("abcdefg").len(), 3);
    }

    #[test]
    fn test_split_document_carries_metadata_and_offsets() {
        let splitter = TextSplitter::new(400, 200);
        let doc = SourceDocument::from_source("y".repeat(900), "guide.pdf");
        let chunks = splitter.split_document(&doc);
        assert_eq!(chunks.len(), expected_count(900, 400, 200));
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert_eq!(chunk.metadata["source"], "guide.pdf");
        }
        assert_eq!(chunks[1].start_offset, 200);
        assert_eq!(chunks.last().unwrap().end_offset, 900);
    }

    #[test]
    fn test_resplitting_produces_fresh_ids() {
        let splitter = TextSplitter::default();
        let doc = SourceDocument::from_source("same content", "a.txt");
        let first = splitter.split_document(&doc);
        let second = splitter.split_document(&doc);
        assert_eq!(first[0].text, second[0].text);
        assert_ne!(first[0].id, second[0].id);
    }

    #[test]
    fn test_payload_layout() {
        let doc = SourceDocument::from_source("hello", "a.txt");
        let chunk = &TextSplitter::default().split_document(&doc)[0];
        let payload = chunk.to_payload();
        assert_eq!(payload["page_content"], "hello");
        assert_eq!(payload["metadata"]["source"], "a.txt");
    }
}
