//! Corpus enumeration: the set of documents a full sync reconciles against.

use std::path::{Path, PathBuf};

use {
    async_trait::async_trait,
    tracing::{debug, warn},
    walkdir::WalkDir,
};

use crate::hash::sha256_hex;

/// Origin tag for documents from the memory directories.
pub const MEMORY_SOURCE: &str = "memory";

/// One document currently present in the corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusDocument {
    /// Logical path; the identity of the document in the index.
    pub path: String,
    /// Origin tag stored with the file and its chunks.
    pub source: String,
    /// Text used for chunking. May be a lossy decode of the raw bytes.
    pub content: String,
    /// SHA-256 of the raw bytes, used for change detection.
    pub hash: String,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: i64,
    pub size: i64,
}

impl CorpusDocument {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            source: MEMORY_SOURCE.to_string(),
            hash: sha256_hex(&content),
            size: content.len() as i64,
            mtime: chrono::Utc::now().timestamp(),
            content,
        }
    }

    /// Build from raw bytes. The hash covers the bytes, so edits that decode
    /// to the same lossy text are still detected.
    pub fn from_bytes(path: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            path: path.into(),
            source: MEMORY_SOURCE.to_string(),
            content: String::from_utf8_lossy(bytes).into_owned(),
            hash: sha256_hex(bytes),
            size: bytes.len() as i64,
            mtime: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

/// Result of enumerating a corpus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorpusScan {
    pub documents: Vec<CorpusDocument>,
    /// Paths that exist but could not be read this time. Sync leaves their
    /// indexed chunks alone instead of treating them as deleted.
    pub unreadable: Vec<String>,
}

/// Supplies the current corpus to [`crate::manager::MemoryManager::sync`].
#[async_trait]
pub trait CorpusSource: Send + Sync {
    async fn scan(&self) -> anyhow::Result<CorpusScan>;
}

/// Markdown files under a set of directories.
pub struct DirectoryCorpus {
    dirs: Vec<PathBuf>,
}

impl DirectoryCorpus {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }
}

fn is_markdown(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("md" | "markdown")
    )
}

async fn read_document(path: &Path) -> anyhow::Result<CorpusDocument> {
    let bytes = tokio::fs::read(path).await?;
    let metadata = tokio::fs::metadata(path).await?;
    let mtime = metadata
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    let mut doc = CorpusDocument::from_bytes(path.to_string_lossy(), &bytes);
    doc.mtime = mtime;
    Ok(doc)
}

#[async_trait]
impl CorpusSource for DirectoryCorpus {
    async fn scan(&self) -> anyhow::Result<CorpusScan> {
        let mut scan = CorpusScan::default();

        for dir in &self.dirs {
            if !dir.exists() {
                debug!(?dir, "memory directory does not exist, skipping");
                continue;
            }

            let mut paths = Vec::new();
            for entry in WalkDir::new(dir).follow_links(true) {
                match entry {
                    Ok(entry) => {
                        let path = entry.into_path();
                        if path.is_file() && is_markdown(&path) {
                            paths.push(path);
                        }
                    },
                    // A dangling link or unreadable entry still names a document.
                    Err(e) => {
                        if let Some(path) = e.path().filter(|p| is_markdown(p)) {
                            warn!(path = %path.display(), error = %e, "failed to stat memory file");
                            scan.unreadable.push(path.to_string_lossy().into_owned());
                        }
                    },
                }
            }
            paths.sort();

            for path in paths {
                match read_document(&path).await {
                    Ok(doc) => scan.documents.push(doc),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to read memory file");
                        scan.unreadable.push(path.to_string_lossy().into_owned());
                    },
                }
            }
        }

        Ok(scan)
    }
}

/// A fixed, in-memory corpus.
#[derive(Debug, Clone, Default)]
pub struct StaticCorpus {
    scan: CorpusScan,
}

impl StaticCorpus {
    pub fn new(docs: Vec<CorpusDocument>) -> Self {
        Self {
            scan: CorpusScan {
                documents: docs,
                unreadable: Vec::new(),
            },
        }
    }

    /// Also report `paths` as present but unreadable.
    pub fn with_unreadable(mut self, paths: Vec<String>) -> Self {
        self.scan.unreadable = paths;
        self
    }
}

#[async_trait]
impl CorpusSource for StaticCorpus {
    async fn scan(&self) -> anyhow::Result<CorpusScan> {
        Ok(self.scan.clone())
    }
}
