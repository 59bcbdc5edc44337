use std::path::{Path, PathBuf};

use {anyhow::Context, serde::Deserialize};

/// Configuration for the memory subsystem.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Path to the SQLite database file (or `:memory:` for tests).
    pub db_path: String,
    /// Directories scanned by [`crate::corpus::DirectoryCorpus`].
    pub memory_dirs: Vec<PathBuf>,
    /// Request the FTS5 index. When `false` keyword search reports itself
    /// unavailable and hybrid search runs on vectors alone.
    pub full_text: bool,
    pub chunking: ChunkConfig,
    pub search: SearchConfig,
    pub embeddings: EmbeddingsConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            memory_dirs: vec![PathBuf::from("memory")],
            full_text: true,
            chunking: ChunkConfig::default(),
            search: SearchConfig::default(),
            embeddings: EmbeddingsConfig::default(),
        }
    }
}

impl MemoryConfig {
    /// Parse a TOML document. Missing keys fall back to their defaults.
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("invalid memory configuration")
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&raw)
    }
}

/// Chunk sizing, in approximate tokens (one token ≈ four characters).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Target chunk size in tokens.
    pub target_tokens: usize,
    /// Overlap carried into the next chunk, in tokens.
    pub overlap_tokens: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            target_tokens: 400,
            overlap_tokens: 80,
        }
    }
}

/// Hybrid search tuning.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Maximum number of results returned.
    pub max_results: usize,
    /// Results scoring below this are dropped.
    pub min_score: f32,
    /// Weight for vector similarity in hybrid search (0.0–1.0).
    pub vector_weight: f32,
    /// Weight for keyword/FTS similarity in hybrid search (0.0–1.0).
    pub text_weight: f32,
    /// Each sub-search fetches `max_results * candidate_multiplier` candidates.
    pub candidate_multiplier: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results: 5,
            min_score: 0.1,
            vector_weight: 0.7,
            text_weight: 0.3,
            candidate_multiplier: 4,
        }
    }
}

impl SearchConfig {
    /// Number of candidates each sub-search should fetch.
    pub fn candidate_limit(&self) -> usize {
        self.max_results
            .saturating_mul(self.candidate_multiplier.max(1))
            .max(1)
    }

    /// Vector and text weights scaled to sum to 1.
    ///
    /// Non-finite or negative weights count as zero; if nothing is left the
    /// default 0.7/0.3 split applies.
    pub fn normalized_weights(&self) -> (f32, f32) {
        let clean = |w: f32| if w.is_finite() { w.max(0.0) } else { 0.0 };
        let vector = clean(self.vector_weight);
        let text = clean(self.text_weight);
        let total = vector + text;
        if total <= 0.0 {
            let fallback = Self::default();
            let total = fallback.vector_weight + fallback.text_weight;
            return (fallback.vector_weight / total, fallback.text_weight / total);
        }
        (vector / total, text / total)
    }
}

/// Remote embedding provider settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    /// Provider identifier. Only `"openai"` (any OpenAI-compatible endpoint)
    /// is built in; hosts can plug their own [`crate::embeddings::EmbeddingProvider`].
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "text-embedding-3-small".into(),
            dimensions: 1536,
            base_url: "https://api.openai.com".into(),
            api_key_env: "OPENAI_API_KEY".into(),
        }
    }
}

fn default_db_path() -> String {
    directories::ProjectDirs::from("", "", "recall")
        .map(|dirs| dirs.data_dir().join("memory.db"))
        .unwrap_or_else(|| PathBuf::from("memory.db"))
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = MemoryConfig::default();
        assert_eq!(config.chunking.target_tokens, 400);
        assert_eq!(config.chunking.overlap_tokens, 80);
        assert_eq!(config.search.max_results, 5);
        assert_eq!(config.search.candidate_multiplier, 4);
        assert!((config.search.min_score - 0.1).abs() < f32::EPSILON);
        assert!(config.full_text);
        assert!(config.db_path.ends_with("memory.db"));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = MemoryConfig::from_toml_str(
            r#"
            db_path = ":memory:"
            full_text = false

            [search]
            max_results = 10
            vector_weight = 1.0

            [embeddings]
            model = "nomic-embed-text"
            dimensions = 768
            "#,
        )
        .unwrap();

        assert_eq!(config.db_path, ":memory:");
        assert!(!config.full_text);
        assert_eq!(config.search.max_results, 10);
        assert!((config.search.text_weight - 0.3).abs() < f32::EPSILON);
        assert_eq!(config.chunking, ChunkConfig::default());
        assert_eq!(config.embeddings.model, "nomic-embed-text");
        assert_eq!(config.embeddings.provider, "openai");
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.toml");
        std::fs::write(&path, "memory_dirs = [\"notes\", \"logs\"]\n").unwrap();

        let config = MemoryConfig::load(&path).unwrap();
        assert_eq!(
            config.memory_dirs,
            vec![PathBuf::from("notes"), PathBuf::from("logs")]
        );
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(MemoryConfig::from_toml_str("search = 3").is_err());
    }

    #[test]
    fn weights_normalize_to_one() {
        let search = SearchConfig {
            vector_weight: 2.0,
            text_weight: 2.0,
            ..SearchConfig::default()
        };
        assert_eq!(search.normalized_weights(), (0.5, 0.5));

        let (v, t) = SearchConfig::default().normalized_weights();
        assert!((v + t - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_weights_fall_back_to_default_split() {
        let search = SearchConfig {
            vector_weight: 0.0,
            text_weight: -1.0,
            ..SearchConfig::default()
        };
        let (v, t) = search.normalized_weights();
        assert!((v - 0.7).abs() < 1e-6);
        assert!((t - 0.3).abs() < 1e-6);
    }

    #[test]
    fn candidate_limit_never_zero() {
        let search = SearchConfig {
            max_results: 0,
            candidate_multiplier: 0,
            ..SearchConfig::default()
        };
        assert_eq!(search.candidate_limit(), 1);
        assert_eq!(SearchConfig::default().candidate_limit(), 20);
    }
}
