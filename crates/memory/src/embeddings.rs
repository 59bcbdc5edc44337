//! Embedding provider abstraction.

use async_trait::async_trait;

/// Maps text to fixed-length vectors.
///
/// `embed_batch` must preserve input order. `is_available` is a cheap local
/// check (credential present, model configured) and must not touch the
/// network.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Identity used to partition the embedding cache. Providers serving the
    /// same model name from different endpoints should return distinct keys.
    fn provider_key(&self) -> &str {
        self.model_name()
    }

    fn is_available(&self) -> bool {
        true
    }
}
