//! Storage abstraction for files, chunks and the embedding cache.

use async_trait::async_trait;

use crate::schema::{CachedEmbedding, ChunkRow, FileRow, KeywordMatch};

/// Persistence for the memory index.
///
/// Every method that writes more than one row for a single logical unit runs
/// inside one transaction: readers see either the old rows or the new ones.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    // files
    async fn get_file(&self, path: &str) -> anyhow::Result<Option<FileRow>>;
    async fn list_files(&self) -> anyhow::Result<Vec<FileRow>>;

    // chunks
    async fn upsert_chunks(&self, chunks: &[ChunkRow]) -> anyhow::Result<()>;
    async fn get_chunks_for_file(&self, path: &str) -> anyhow::Result<Vec<ChunkRow>>;
    async fn get_chunk_by_id(&self, id: &str) -> anyhow::Result<Option<ChunkRow>>;
    async fn count_chunks(&self) -> anyhow::Result<u64>;
    async fn count_chunks_for_file(&self, path: &str) -> anyhow::Result<u64>;

    /// Atomically replace every chunk of `file.path` with `chunks` and
    /// upsert the file row.
    async fn replace_file(&self, file: &FileRow, chunks: &[ChunkRow]) -> anyhow::Result<()>;

    /// Atomically delete every chunk and the file row for `path`.
    /// Returns the number of chunk rows removed.
    async fn remove_path(&self, path: &str) -> anyhow::Result<u64>;

    /// All chunks embedded with `model`. Rows whose stored vector cannot be
    /// decoded are skipped.
    async fn list_embedded_chunks(&self, model: &str) -> anyhow::Result<Vec<ChunkRow>>;

    // full-text
    /// Whether the full-text index exists and is being maintained.
    fn fts_available(&self) -> bool;

    /// Ranked full-text match. `Ok(None)` when the index is unavailable.
    async fn keyword_search(
        &self,
        fts_query: &str,
        limit: usize,
    ) -> anyhow::Result<Option<Vec<KeywordMatch>>>;

    // embedding cache
    async fn get_cached_embeddings(
        &self,
        provider: &str,
        model: &str,
        hashes: &[String],
    ) -> anyhow::Result<Vec<CachedEmbedding>>;

    async fn put_cached_embeddings(
        &self,
        provider: &str,
        model: &str,
        entries: &[CachedEmbedding],
    ) -> anyhow::Result<()>;

    async fn clear_embedding_cache(&self) -> anyhow::Result<u64>;

    /// Release underlying resources. Further calls may fail.
    async fn close(&self) {}
}
