//! Memory indexing: a corpus of documents → chunked → embedded → hybrid search in SQLite.
//!
//! [`manager::MemoryManager`] is the entry point. It keeps a SQLite index in
//! step with a [`corpus::CorpusSource`], embeds chunks through a cached
//! [`embeddings::EmbeddingProvider`] and answers queries with a weighted merge
//! of vector similarity and FTS5 keyword ranking.

pub mod chunker;
pub mod config;
pub mod corpus;
pub mod embeddings;
pub mod embeddings_cache;
pub mod embeddings_openai;
pub mod error;
pub mod hash;
pub mod manager;
pub mod schema;
pub mod search;
pub mod store;
pub mod store_sqlite;

#[cfg(test)]
mod test_support;

pub use {
    config::MemoryConfig,
    error::EmbeddingError,
    manager::{MemoryManager, MemoryStatus, SyncReport},
    schema::run_migrations,
    search::SearchResult,
};
