//! Shared fakes for unit tests.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;

use crate::{
    embeddings::EmbeddingProvider,
    store_sqlite::{SqliteMemoryStore, connect},
};

/// Each dimension corresponds to a keyword; 1.0 if the text contains it.
pub const KEYWORDS: [&str; 10] = [
    "rust", "python", "database", "memory", "search", "network", "cooking", "music", "dark",
    "report",
];

pub fn keyword_embedding(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    KEYWORDS
        .iter()
        .map(|kw| if lower.contains(kw) { 1.0 } else { 0.0 })
        .collect()
}

#[derive(Clone, Default)]
struct Switches {
    calls: Arc<AtomicUsize>,
    texts: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
    failing: Arc<AtomicBool>,
}

/// Deterministic bag-of-keywords provider that counts batch calls and can be
/// switched unavailable or failing from the test body.
pub struct KeywordEmbedder {
    switches: Switches,
}

/// Test-side view of a [`KeywordEmbedder`] that has been boxed away.
#[derive(Clone)]
pub struct KeywordEmbedderHandle {
    switches: Switches,
}

impl KeywordEmbedder {
    pub fn new() -> (Self, KeywordEmbedderHandle) {
        let switches = Switches::default();
        (
            Self {
                switches: switches.clone(),
            },
            KeywordEmbedderHandle { switches },
        )
    }
}

impl KeywordEmbedderHandle {
    /// Number of provider batch calls.
    pub fn calls(&self) -> usize {
        self.switches.calls.load(Ordering::SeqCst)
    }

    /// Number of texts sent to the provider across all calls.
    pub fn texts_embedded(&self) -> usize {
        self.switches.texts.load(Ordering::SeqCst)
    }

    pub fn set_available(&self, available: bool) {
        self.switches.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.switches.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.switches.calls.fetch_add(1, Ordering::SeqCst);
        if self.switches.failing.load(Ordering::SeqCst) {
            anyhow::bail!("simulated provider outage");
        }
        self.switches.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| keyword_embedding(t)).collect())
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }

    fn dimensions(&self) -> usize {
        KEYWORDS.len()
    }

    fn provider_key(&self) -> &str {
        "mock"
    }

    fn is_available(&self) -> bool {
        !self.switches.unavailable.load(Ordering::SeqCst)
    }
}

/// Fresh in-memory store with full-text search enabled.
pub async fn memory_store() -> Arc<SqliteMemoryStore> {
    memory_store_with_full_text(true).await
}

#[allow(clippy::expect_used)]
pub async fn memory_store_with_full_text(full_text: bool) -> Arc<SqliteMemoryStore> {
    let pool = connect(":memory:").await.expect("in-memory pool");
    let store = SqliteMemoryStore::with_full_text(pool, full_text)
        .await
        .expect("in-memory store");
    Arc::new(store)
}
