/// Memory manager: orchestrates corpus sync, chunking, embedding, and search.
use std::{collections::HashSet, sync::Arc};

use {
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use crate::{
    chunker::{RawChunk, chunk_text},
    config::{MemoryConfig, SearchConfig},
    corpus::{CorpusDocument, CorpusSource, DirectoryCorpus},
    embeddings::EmbeddingProvider,
    embeddings_cache::CachedEmbedder,
    embeddings_openai::OpenAiEmbeddingProvider,
    error::EmbeddingError,
    schema::{ChunkRow, FileRow},
    search::{self, SearchResult},
    store::MemoryStore,
    store_sqlite::SqliteMemoryStore,
};

pub struct MemoryManager {
    config: MemoryConfig,
    store: Arc<dyn MemoryStore>,
    embedder: CachedEmbedder,
    corpus: Box<dyn CorpusSource>,
    sync_lock: Mutex<()>,
}

/// Status info about the memory system.
#[derive(Debug, Clone)]
pub struct MemoryStatus {
    pub total_files: usize,
    pub total_chunks: u64,
    pub embedding_model: String,
    pub embeddings_available: bool,
    pub full_text_available: bool,
}

/// Outcome of one full sync pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Documents returned by the corpus.
    pub files_scanned: usize,
    /// Chunks written for new or changed documents.
    pub chunks_indexed: usize,
    /// Chunks left in place because their document was unchanged.
    pub chunks_skipped: usize,
    /// Texts sent to the embedding provider (cache misses).
    pub embeddings_requested: usize,
    pub files_updated: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub errors: usize,
    /// The pass stopped before reindexing everything because embeddings
    /// were unavailable or the provider failed. Not an error; the next sync
    /// picks up where this one left off.
    pub paused: bool,
}

impl MemoryManager {
    pub fn new(
        config: MemoryConfig,
        store: Arc<dyn MemoryStore>,
        embedder: Box<dyn EmbeddingProvider>,
        corpus: Box<dyn CorpusSource>,
    ) -> Self {
        let embedder = CachedEmbedder::new(embedder, Arc::clone(&store));
        Self {
            config,
            store,
            embedder,
            corpus,
            sync_lock: Mutex::new(()),
        }
    }

    /// Open the SQLite store, the configured embedding provider and a
    /// directory corpus over `config.memory_dirs`.
    pub async fn from_config(config: MemoryConfig) -> anyhow::Result<Self> {
        let embedder: Box<dyn EmbeddingProvider> = match config.embeddings.provider.as_str() {
            "openai" => Box::new(OpenAiEmbeddingProvider::from_config(&config.embeddings)),
            other => anyhow::bail!("unsupported embedding provider: {other}"),
        };
        let store = Arc::new(SqliteMemoryStore::open(&config).await?);
        let corpus = Box::new(DirectoryCorpus::new(config.memory_dirs.clone()));
        Ok(Self::new(config, store, embedder, corpus))
    }

    /// Reconcile the index with the current corpus.
    ///
    /// Unchanged documents (same content hash) are skipped. Documents that
    /// left the corpus are removed before anything is reindexed. Each changed
    /// document is re-chunked, embedded and swapped in with one transaction.
    /// Concurrent calls are serialized.
    pub async fn sync(&self) -> anyhow::Result<SyncReport> {
        let _guard = self.sync_lock.lock().await;
        let mut report = SyncReport::default();

        let scan = self.corpus.scan().await?;
        report.files_scanned = scan.documents.len();

        // Unreadable paths still exist; keep whatever was indexed for them.
        let mut present: HashSet<String> = scan.unreadable.into_iter().collect();
        report.errors += present.len();

        let mut pending = Vec::new();
        let mut seen = HashSet::new();
        for doc in scan.documents {
            if !seen.insert(doc.path.clone()) {
                warn!(path = %doc.path, "duplicate path in corpus, keeping the first");
                continue;
            }
            present.insert(doc.path.clone());
            match self.store.get_file(&doc.path).await? {
                Some(existing) if existing.hash == doc.hash => {
                    report.files_unchanged += 1;
                    let kept = self.store.count_chunks_for_file(&doc.path).await?;
                    report.chunks_skipped += kept as usize;
                },
                _ => {
                    let chunks = chunk_text(&doc.content, &self.config.chunking);
                    pending.push((doc, chunks));
                },
            }
        }

        // Remove files no longer in the corpus
        for file in self.store.list_files().await? {
            if !present.contains(&file.path) {
                info!(path = %file.path, "removing deleted file from memory");
                self.store.remove_path(&file.path).await?;
                report.files_removed += 1;
            }
        }

        // Documents that chunk to nothing need no embeddings.
        let (empty, pending): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|(_, chunks)| chunks.is_empty());
        for (doc, _) in empty {
            self.store.replace_file(&file_row(&doc), &[]).await?;
            debug!(path = %doc.path, "synced empty file");
            report.files_updated += 1;
        }

        if pending.is_empty() {
            return Ok(report);
        }
        if !self.embedder.is_available() {
            info!(
                pending = pending.len(),
                "embeddings unavailable, leaving changed files unindexed"
            );
            report.paused = true;
            return Ok(report);
        }

        let model = self.embedder.model_name().to_string();
        for (doc, chunks) in pending {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();

            let batch = match self.embedder.embed_batch_with_stats(&texts).await {
                Ok(batch) => batch,
                Err(EmbeddingError::Store(e)) => return Err(e),
                Err(e) => {
                    warn!(path = %doc.path, error = %e, "embedding failed, pausing sync");
                    report.errors += 1;
                    report.paused = true;
                    break;
                },
            };
            report.embeddings_requested += batch.requested;

            let embeddings = batch.vectors.into_iter().map(Some).collect();
            let rows = chunk_rows(&doc.path, &doc.source, &model, &chunks, embeddings);
            self.store.replace_file(&file_row(&doc), &rows).await?;

            info!(path = %doc.path, chunks = rows.len(), "synced file");
            report.files_updated += 1;
            report.chunks_indexed += rows.len();
        }

        Ok(report)
    }

    /// Index a piece of text that is not backed by a corpus document.
    ///
    /// Chunks are tagged with `source` and `path` and returned by id. No file
    /// row is written, so the next sync leaves them alone. Without an
    /// available embedding provider the chunks are stored keyword-only.
    pub async fn index_text(
        &self,
        text: &str,
        source: &str,
        path: &str,
    ) -> anyhow::Result<Vec<String>> {
        let chunks = chunk_text(text, &self.config.chunking);
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let embeddings: Vec<Option<Vec<f32>>>;
        let model = if self.embedder.is_available() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;
            embeddings = vectors.into_iter().map(Some).collect();
            self.embedder.model_name().to_string()
        } else {
            debug!(path, "embeddings unavailable, storing keyword-only capture");
            embeddings = vec![None; chunks.len()];
            String::new()
        };

        let rows = chunk_rows(path, source, &model, &chunks, embeddings);
        self.store.upsert_chunks(&rows).await?;
        info!(path, source, chunks = rows.len(), "indexed text");
        Ok(rows.into_iter().map(|r| r.id).collect())
    }

    /// Delete every chunk (and the file row, if any) for `path`.
    /// Returns the number of chunks removed; zero if nothing was indexed.
    pub async fn remove_chunks_by_path(&self, path: &str) -> anyhow::Result<u64> {
        let removed = self.store.remove_path(path).await?;
        if removed > 0 {
            info!(path, chunks = removed, "removed path from memory");
        }
        Ok(removed)
    }

    /// Search memory using hybrid vector + keyword search. `None` uses the
    /// configured defaults.
    pub async fn search(
        &self,
        query: &str,
        config: Option<&SearchConfig>,
    ) -> anyhow::Result<Vec<SearchResult>> {
        let config = config.unwrap_or(&self.config.search);
        search::hybrid_search(self.store.as_ref(), &self.embedder, query, config).await
    }

    /// Best existing match for `text` scoring at least `min_score`, used to
    /// skip storing near-duplicate captures.
    pub async fn find_duplicate(
        &self,
        text: &str,
        min_score: f32,
    ) -> anyhow::Result<Option<SearchResult>> {
        let config = SearchConfig {
            max_results: 1,
            min_score,
            ..self.config.search
        };
        Ok(self.search(text, Some(&config)).await?.into_iter().next())
    }

    /// Get a specific chunk by ID.
    pub async fn get_chunk(&self, id: &str) -> anyhow::Result<Option<ChunkRow>> {
        self.store.get_chunk_by_id(id).await
    }

    /// Get status information about the memory system.
    pub async fn status(&self) -> anyhow::Result<MemoryStatus> {
        let files = self.store.list_files().await?;
        let total_chunks = self.store.count_chunks().await?;
        Ok(MemoryStatus {
            total_files: files.len(),
            total_chunks,
            embedding_model: self.embedder.model_name().to_string(),
            embeddings_available: self.embedder.is_available(),
            full_text_available: self.store.fts_available(),
        })
    }

    /// Release the store. The manager should not be used afterwards.
    pub async fn close(&self) {
        self.store.close().await;
    }
}

fn file_row(doc: &CorpusDocument) -> FileRow {
    FileRow {
        path: doc.path.clone(),
        source: doc.source.clone(),
        hash: doc.hash.clone(),
        mtime: doc.mtime,
        size: doc.size,
    }
}

fn chunk_rows(
    path: &str,
    source: &str,
    model: &str,
    chunks: &[RawChunk],
    embeddings: Vec<Option<Vec<f32>>>,
) -> Vec<ChunkRow> {
    let now = chrono::Utc::now().timestamp();
    chunks
        .iter()
        .zip(embeddings)
        .map(|(chunk, embedding)| ChunkRow {
            id: uuid::Uuid::new_v4().to_string(),
            path: path.to_string(),
            source: source.to_string(),
            start_line: chunk.start_line as i64,
            end_line: chunk.end_line as i64,
            hash: chunk.hash.clone(),
            model: model.to_string(),
            text: chunk.text.clone(),
            embedding,
            updated_at: now,
        })
        .collect()
}
