//! Embedding cache in front of an [`EmbeddingProvider`].
//!
//! Texts are keyed by `(provider_key, model, sha256(text))`. Only cache misses
//! reach the provider, in a single batch; new vectors are written back before
//! they are returned.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tracing::debug;

use crate::{
    embeddings::EmbeddingProvider,
    error::EmbeddingError,
    hash::sha256_hex,
    schema::CachedEmbedding,
    store::MemoryStore,
};

/// Vectors for one batch plus how they were obtained.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchEmbedding {
    /// One vector per input text, in input order.
    pub vectors: Vec<Vec<f32>>,
    /// Inputs answered from the cache.
    pub cache_hits: usize,
    /// Distinct texts sent to the provider.
    pub requested: usize,
}

pub struct CachedEmbedder {
    provider: Box<dyn EmbeddingProvider>,
    store: Arc<dyn MemoryStore>,
}

impl CachedEmbedder {
    pub fn new(provider: Box<dyn EmbeddingProvider>, store: Arc<dyn MemoryStore>) -> Self {
        Self { provider, store }
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_available()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn provider_key(&self) -> &str {
        self.provider.provider_key()
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    /// Embed a single text.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let batch = self.embed_batch_with_stats(&[text.to_string()]).await?;
        batch
            .vectors
            .into_iter()
            .next()
            .ok_or(EmbeddingError::CountMismatch {
                expected: 1,
                got: 0,
            })
    }

    /// Embed `texts`, preserving order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(self.embed_batch_with_stats(texts).await?.vectors)
    }

    /// Embed `texts` and report cache hits and provider requests.
    ///
    /// A failed provider call fails the whole batch and writes nothing to
    /// the cache.
    pub async fn embed_batch_with_stats(
        &self,
        texts: &[String],
    ) -> Result<BatchEmbedding, EmbeddingError> {
        if texts.is_empty() {
            return Ok(BatchEmbedding::default());
        }
        if !self.provider.is_available() {
            return Err(EmbeddingError::Unavailable {
                provider: self.provider.provider_key().to_string(),
            });
        }

        let provider_key = self.provider.provider_key();
        let model = self.provider.model_name();
        let hashes: Vec<String> = texts.iter().map(sha256_hex).collect();

        let mut unique = Vec::new();
        let mut seen = HashSet::new();
        for hash in &hashes {
            if seen.insert(hash.as_str()) {
                unique.push(hash.clone());
            }
        }

        let mut by_hash: HashMap<String, Vec<f32>> = self
            .store
            .get_cached_embeddings(provider_key, model, &unique)
            .await
            .map_err(EmbeddingError::Store)?
            .into_iter()
            .map(|entry| (entry.hash, entry.embedding))
            .collect();

        let cache_hits = hashes.iter().filter(|h| by_hash.contains_key(*h)).count();

        let mut missing_hashes = Vec::new();
        let mut missing_texts = Vec::new();
        let mut queued = HashSet::new();
        for (text, hash) in texts.iter().zip(&hashes) {
            if !by_hash.contains_key(hash) && queued.insert(hash.as_str()) {
                missing_hashes.push(hash.clone());
                missing_texts.push(text.clone());
            }
        }

        let requested = missing_texts.len();
        if requested > 0 {
            debug!(model, cache_hits, requested, "embedding cache misses sent to provider");
            let fresh = self
                .provider
                .embed_batch(&missing_texts)
                .await
                .map_err(EmbeddingError::Provider)?;
            if fresh.len() != requested {
                return Err(EmbeddingError::CountMismatch {
                    expected: requested,
                    got: fresh.len(),
                });
            }
            if fresh.iter().any(Vec::is_empty) {
                return Err(EmbeddingError::Provider(anyhow::anyhow!(
                    "provider returned an empty embedding"
                )));
            }

            let entries: Vec<CachedEmbedding> = missing_hashes
                .into_iter()
                .zip(fresh)
                .map(|(hash, embedding)| CachedEmbedding { hash, embedding })
                .collect();
            self.store
                .put_cached_embeddings(provider_key, model, &entries)
                .await
                .map_err(EmbeddingError::Store)?;
            by_hash.extend(entries.into_iter().map(|e| (e.hash, e.embedding)));
        }

        let vectors = hashes
            .iter()
            .filter_map(|h| by_hash.get(h).cloned())
            .collect::<Vec<_>>();
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                got: vectors.len(),
            });
        }

        Ok(BatchEmbedding {
            vectors,
            cache_hits,
            requested,
        })
    }
}
