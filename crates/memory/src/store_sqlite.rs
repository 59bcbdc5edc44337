//! SQLite-backed [`MemoryStore`].
//!
//! Vectors are persisted as little-endian `f32` BLOBs and decoded here, so no
//! serialized form ever crosses the trait boundary.

use std::{path::Path, time::Duration};

use {
    async_trait::async_trait,
    sqlx::{
        Row, SqliteConnection, SqlitePool,
        sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    },
    tracing::{debug, info, warn},
};

use crate::{
    config::MemoryConfig,
    schema::{CachedEmbedding, ChunkRow, FileRow, KeywordMatch, run_migrations},
    store::MemoryStore,
};

const FTS_TABLE: &str = "chunks_fts";

const CHUNK_COLUMNS: &str =
    "id, path, source, start_line, end_line, hash, model, text, embedding, updated_at";

pub struct SqliteMemoryStore {
    pool: SqlitePool,
    fts: FtsMode,
}

/// How writes treat the full-text table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FtsMode {
    /// New chunks are indexed and keyword search is served.
    index: bool,
    /// The table exists, so rows for deleted or replaced chunks are purged
    /// even while indexing is off.
    purge: bool,
}

impl SqliteMemoryStore {
    /// Wrap an existing pool, run migrations and enable full-text search if
    /// the SQLite build supports FTS5.
    pub async fn new(pool: SqlitePool) -> anyhow::Result<Self> {
        Self::with_full_text(pool, true).await
    }

    /// Like [`Self::new`], but `full_text = false` stops indexing new chunks
    /// and keyword search reports itself unavailable. An existing FTS5 table
    /// is still purged on deletes.
    pub async fn with_full_text(pool: SqlitePool, full_text: bool) -> anyhow::Result<Self> {
        run_migrations(&pool).await?;
        let fts = if full_text {
            let ready = ensure_fts_table(&pool).await;
            FtsMode {
                index: ready,
                purge: ready || fts_table_exists(&pool).await?,
            }
        } else {
            FtsMode {
                index: false,
                purge: fts_table_exists(&pool).await?,
            }
        };
        Ok(Self { pool, fts })
    }

    /// Open (creating if needed) the database named by `config.db_path`.
    pub async fn open(config: &MemoryConfig) -> anyhow::Result<Self> {
        let pool = connect(&config.db_path).await?;
        Self::with_full_text(pool, config.full_text).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Build a connection pool for `db_path`.
///
/// `:memory:` gets a single long-lived connection so the database is not
/// dropped when the pool recycles idle connections.
pub async fn connect(db_path: &str) -> anyhow::Result<SqlitePool> {
    if db_path == ":memory:" {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect(":memory:")
            .await?;
        return Ok(pool);
    }

    if let Some(parent) = Path::new(db_path).parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    debug!(db_path, "opening memory database");
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

async fn fts_table_exists(pool: &SqlitePool) -> Result<bool, sqlx::Error> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(FTS_TABLE)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

/// Create the FTS5 table, rebuilding it if its ids drifted from `chunks`
/// (e.g. the database was previously used with full-text disabled).
async fn ensure_fts_table(pool: &SqlitePool) -> bool {
    let created = sqlx::query(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS {FTS_TABLE} USING fts5(
            text,
            id UNINDEXED,
            path UNINDEXED,
            source UNINDEXED,
            start_line UNINDEXED,
            end_line UNINDEXED
        )"
    ))
    .execute(pool)
    .await;

    if let Err(e) = created {
        warn!(error = %e, "FTS5 unavailable, keyword search disabled");
        return false;
    }

    match backfill_fts(pool).await {
        Ok(0) => true,
        Ok(n) => {
            info!(rows = n, "rebuilt full-text index");
            true
        },
        Err(e) => {
            warn!(error = %e, "failed to rebuild full-text index, keyword search disabled");
            false
        },
    }
}

async fn backfill_fts(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let (drift,): (i64,) = sqlx::query_as(&format!(
        "SELECT
            (SELECT count(*) FROM (SELECT id FROM chunks EXCEPT SELECT id FROM {FTS_TABLE}))
          + (SELECT count(*) FROM (SELECT id FROM {FTS_TABLE} EXCEPT SELECT id FROM chunks))"
    ))
    .fetch_one(pool)
    .await?;
    if drift == 0 {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;
    sqlx::query(&format!("DELETE FROM {FTS_TABLE}"))
        .execute(&mut *tx)
        .await?;
    let inserted = sqlx::query(&format!(
        "INSERT INTO {FTS_TABLE} (text, id, path, source, start_line, end_line)
         SELECT text, id, path, source, start_line, end_line FROM chunks"
    ))
    .execute(&mut *tx)
    .await?
    .rows_affected();
    tx.commit().await?;
    Ok(inserted)
}

pub(crate) fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub(crate) fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

fn read_chunk(row: &SqliteRow) -> Result<ChunkRow, sqlx::Error> {
    let id: String = row.try_get("id")?;
    let blob: Option<Vec<u8>> = row.try_get("embedding")?;
    let embedding = blob.and_then(|bytes| {
        let decoded = decode_embedding(&bytes);
        if decoded.is_none() {
            warn!(chunk_id = %id, bytes = bytes.len(), "malformed stored embedding");
        }
        decoded
    });
    Ok(ChunkRow {
        path: row.try_get("path")?,
        source: row.try_get("source")?,
        start_line: row.try_get("start_line")?,
        end_line: row.try_get("end_line")?,
        hash: row.try_get("hash")?,
        model: row.try_get("model")?,
        text: row.try_get("text")?,
        updated_at: row.try_get("updated_at")?,
        embedding,
        id,
    })
}

fn read_keyword_match(row: &SqliteRow) -> Result<KeywordMatch, sqlx::Error> {
    Ok(KeywordMatch {
        id: row.try_get("id")?,
        path: row.try_get("path")?,
        source: row.try_get("source")?,
        start_line: row.try_get("start_line")?,
        end_line: row.try_get("end_line")?,
        text: row.try_get("text")?,
        rank: row.try_get("score")?,
    })
}

async fn insert_chunk(
    conn: &mut SqliteConnection,
    chunk: &ChunkRow,
    fts: FtsMode,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "INSERT OR REPLACE INTO chunks ({CHUNK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&chunk.id)
    .bind(&chunk.path)
    .bind(&chunk.source)
    .bind(chunk.start_line)
    .bind(chunk.end_line)
    .bind(&chunk.hash)
    .bind(&chunk.model)
    .bind(&chunk.text)
    .bind(chunk.embedding.as_deref().map(encode_embedding))
    .bind(chunk.updated_at)
    .execute(&mut *conn)
    .await?;

    if fts.purge {
        sqlx::query(&format!("DELETE FROM {FTS_TABLE} WHERE id = ?"))
            .bind(&chunk.id)
            .execute(&mut *conn)
            .await?;
    }
    if fts.index {
        sqlx::query(&format!(
            "INSERT INTO {FTS_TABLE} (text, id, path, source, start_line, end_line)
             VALUES (?, ?, ?, ?, ?, ?)"
        ))
        .bind(&chunk.text)
        .bind(&chunk.id)
        .bind(&chunk.path)
        .bind(&chunk.source)
        .bind(chunk.start_line)
        .bind(chunk.end_line)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn delete_chunks(
    conn: &mut SqliteConnection,
    path: &str,
    fts: FtsMode,
) -> Result<u64, sqlx::Error> {
    if fts.purge {
        sqlx::query(&format!("DELETE FROM {FTS_TABLE} WHERE path = ?"))
            .bind(path)
            .execute(&mut *conn)
            .await?;
    }
    let removed = sqlx::query("DELETE FROM chunks WHERE path = ?")
        .bind(path)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(removed)
}

async fn write_file(conn: &mut SqliteConnection, file: &FileRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO files (path, source, hash, mtime, size) VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(path) DO UPDATE SET
            source = excluded.source,
            hash = excluded.hash,
            mtime = excluded.mtime,
            size = excluded.size",
    )
    .bind(&file.path)
    .bind(&file.source)
    .bind(&file.hash)
    .bind(file.mtime)
    .bind(file.size)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

type FileTuple = (String, String, String, i64, i64);

fn file_from_tuple((path, source, hash, mtime, size): FileTuple) -> FileRow {
    FileRow {
        path,
        source,
        hash,
        mtime,
        size,
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn get_file(&self, path: &str) -> anyhow::Result<Option<FileRow>> {
        let row: Option<FileTuple> =
            sqlx::query_as("SELECT path, source, hash, mtime, size FROM files WHERE path = ?")
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(file_from_tuple))
    }

    async fn list_files(&self) -> anyhow::Result<Vec<FileRow>> {
        let rows: Vec<FileTuple> =
            sqlx::query_as("SELECT path, source, hash, mtime, size FROM files ORDER BY path")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(file_from_tuple).collect())
    }

    async fn upsert_chunks(&self, chunks: &[ChunkRow]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            insert_chunk(&mut tx, chunk, self.fts).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_chunks_for_file(&self, path: &str) -> anyhow::Result<Vec<ChunkRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE path = ? ORDER BY start_line, id"
        ))
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(read_chunk)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn get_chunk_by_id(&self, id: &str) -> anyhow::Result<Option<ChunkRow>> {
        let row = sqlx::query(&format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(read_chunk).transpose()?)
    }

    async fn count_chunks(&self) -> anyhow::Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_chunks_for_file(&self, path: &str) -> anyhow::Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM chunks WHERE path = ?")
            .bind(path)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn replace_file(&self, file: &FileRow, chunks: &[ChunkRow]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        delete_chunks(&mut tx, &file.path, self.fts).await?;
        for chunk in chunks {
            insert_chunk(&mut tx, chunk, self.fts).await?;
        }
        write_file(&mut tx, file).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn remove_path(&self, path: &str) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await?;
        let removed = delete_chunks(&mut tx, path, self.fts).await?;
        sqlx::query("DELETE FROM files WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn list_embedded_chunks(&self, model: &str) -> anyhow::Result<Vec<ChunkRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE model = ? AND embedding IS NOT NULL"
        ))
        .bind(model)
        .fetch_all(&self.pool)
        .await?;

        let mut chunks = Vec::with_capacity(rows.len());
        for row in &rows {
            match read_chunk(row) {
                Ok(chunk) if chunk.embedding.is_some() => chunks.push(chunk),
                Ok(_) => {},
                Err(e) => warn!(error = %e, "skipping unreadable chunk row"),
            }
        }
        Ok(chunks)
    }

    fn fts_available(&self) -> bool {
        self.fts.index
    }

    async fn keyword_search(
        &self,
        fts_query: &str,
        limit: usize,
    ) -> anyhow::Result<Option<Vec<KeywordMatch>>> {
        if !self.fts.index {
            return Ok(None);
        }

        let rows = sqlx::query(&format!(
            "SELECT id, path, source,
                    CAST(start_line AS INTEGER) AS start_line,
                    CAST(end_line AS INTEGER) AS end_line,
                    text, bm25({FTS_TABLE}) AS score
             FROM {FTS_TABLE}
             WHERE {FTS_TABLE} MATCH ?
               AND id IN (SELECT id FROM chunks)
             ORDER BY score
             LIMIT ?"
        ))
        .bind(fts_query)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut matches = Vec::with_capacity(rows.len());
        for row in &rows {
            match read_keyword_match(row) {
                Ok(m) => matches.push(m),
                Err(e) => warn!(error = %e, "skipping unreadable full-text row"),
            }
        }
        Ok(Some(matches))
    }

    async fn get_cached_embeddings(
        &self,
        provider: &str,
        model: &str,
        hashes: &[String],
    ) -> anyhow::Result<Vec<CachedEmbedding>> {
        let mut found = Vec::new();
        for hash in hashes {
            let row: Option<(Vec<u8>,)> = sqlx::query_as(
                "SELECT embedding FROM embedding_cache WHERE provider = ? AND model = ? AND hash = ?",
            )
            .bind(provider)
            .bind(model)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;

            let Some((blob,)) = row else {
                continue;
            };
            match decode_embedding(&blob) {
                Some(embedding) => found.push(CachedEmbedding {
                    hash: hash.clone(),
                    embedding,
                }),
                None => warn!(%hash, "malformed cached embedding, treating as a miss"),
            }
        }
        Ok(found)
    }

    async fn put_cached_embeddings(
        &self,
        provider: &str,
        model: &str,
        entries: &[CachedEmbedding],
    ) -> anyhow::Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                "INSERT OR REPLACE INTO embedding_cache
                    (provider, model, hash, embedding, dims, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(provider)
            .bind(model)
            .bind(&entry.hash)
            .bind(encode_embedding(&entry.embedding))
            .bind(entry.embedding.len() as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn clear_embedding_cache(&self) -> anyhow::Result<u64> {
        let removed = sqlx::query("DELETE FROM embedding_cache")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
