//! Row types for the memory database and migration runner.

/// A tracked file row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRow {
    pub path: String,
    pub source: String,
    pub hash: String,
    pub mtime: i64,
    pub size: i64,
}

/// A chunk row.
///
/// `embedding` is decoded at the store boundary; `None` marks a keyword-only
/// chunk captured while no embedding provider was available.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRow {
    pub id: String,
    pub path: String,
    pub source: String,
    pub start_line: i64,
    pub end_line: i64,
    pub hash: String,
    pub model: String,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
    pub updated_at: i64,
}

/// A full-text match with the engine-native FTS5 rank (lower is better).
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordMatch {
    pub id: String,
    pub path: String,
    pub source: String,
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
    pub rank: f64,
}

/// A cached vector for one `(provider, model, hash)` key.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEmbedding {
    pub hash: String,
    pub embedding: Vec<f32>,
}

/// Run database migrations for the memory system.
///
/// This creates the `files`, `chunks` and `embedding_cache` tables. The
/// `chunks_fts` full-text table is optional and created by the store after
/// probing for FTS5 support.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
