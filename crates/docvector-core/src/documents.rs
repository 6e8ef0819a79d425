//! Loading source documents from disk for the indexing path.
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::types::Payload;

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "rst", "html"];

/// A document ready to be chunked. `source_id` is stable across runs for the
/// same relative path.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub source_id: String,
    pub text: String,
    pub metadata: Payload,
}

impl SourceDocument {
    pub fn new(source_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self { source_id: source_id.into(), text: text.into(), metadata: Payload::new() }
    }
}

/// Every text-like file under `dir`, sorted by path. At most `limit` files
/// when given.
pub fn load_directory(dir: &Path, limit: Option<usize>) -> Result<Vec<SourceDocument>> {
    let mut files = list_text_files(dir);
    if files.is_empty() {
        warn!(dir = %dir.display(), "no text files found");
        return Ok(vec![]);
    }
    if let Some(limit) = limit {
        files.truncate(limit);
    }
    let mut docs = Vec::with_capacity(files.len());
    for path in &files {
        let text = read_lossy(path)?;
        let rel = path.strip_prefix(dir).unwrap_or(path);
        let source_id = rel.to_string_lossy().replace('\\', "/");
        let mut metadata = Payload::new();
        metadata.insert("path".into(), Value::String(path.to_string_lossy().to_string()));
        if let Some(title) = title_of(path, &text) {
            metadata.insert("title".into(), Value::String(title));
        }
        debug!(source_id = %source_id, chars = text.chars().count(), "loaded document");
        docs.push(SourceDocument { source_id, text, metadata });
    }
    info!(dir = %dir.display(), documents = docs.len(), "loaded documents");
    Ok(docs)
}

fn list_text_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| TEXT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();
    files
}

fn read_lossy(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(_) => Ok(String::from_utf8_lossy(&fs::read(path)?).to_string()),
    }
}

/// First markdown heading, else the file stem.
fn title_of(path: &Path, text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("# ").map(|t| t.trim().to_string()))
        .or_else(|| path.file_stem().map(|s| s.to_string_lossy().to_string()))
}
