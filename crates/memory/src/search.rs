//! Hybrid search: vector similarity and FTS5 keyword ranking, merged by
//! weighted score.
//!
//! Both sub-searches over-fetch `max_results * candidate_multiplier`
//! candidates. Each degrades independently: no embeddings means no vector
//! candidates, no full-text index means no keyword candidates. With neither,
//! the result is simply empty.

use std::collections::HashMap;

use tracing::debug;

use crate::{
    config::SearchConfig,
    embeddings_cache::CachedEmbedder,
    schema::{ChunkRow, KeywordMatch},
    store::MemoryStore,
};

/// Maximum characters of chunk text returned as a snippet.
pub const SNIPPET_MAX_CHARS: usize = 700;

/// A ranked search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub chunk_id: String,
    pub path: String,
    pub source: String,
    pub start_line: i64,
    pub end_line: i64,
    pub snippet: String,
    /// Weighted, merged score.
    pub score: f32,
    /// Cosine similarity, if the vector search found this chunk.
    pub vector_score: Option<f32>,
    /// Normalized keyword score, if the keyword search found this chunk.
    pub text_score: Option<f32>,
}

/// A sub-search hit before merging.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub chunk_id: String,
    pub path: String,
    pub source: String,
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
    pub score: f32,
}

impl Candidate {
    fn from_chunk(chunk: ChunkRow, score: f32) -> Self {
        Self {
            chunk_id: chunk.id,
            path: chunk.path,
            source: chunk.source,
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            text: chunk.text,
            score,
        }
    }

    fn from_keyword(m: KeywordMatch) -> Self {
        Self {
            score: bm25_rank_to_score(m.rank),
            chunk_id: m.id,
            path: m.path,
            source: m.source,
            start_line: m.start_line,
            end_line: m.end_line,
            text: m.text,
        }
    }

    fn into_result(self, score: f32) -> SearchResult {
        SearchResult {
            snippet: truncate_snippet(&self.text),
            chunk_id: self.chunk_id,
            path: self.path,
            source: self.source,
            start_line: self.start_line,
            end_line: self.end_line,
            score,
            vector_score: None,
            text_score: None,
        }
    }
}

/// Cosine similarity. Empty, zero-norm or mismatched vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Convert an FTS5 rank into a positive, similarity-like score:
/// `1 / (1 + max(0, -rank))`.
pub fn bm25_rank_to_score(rank: f64) -> f32 {
    let penalty = if rank.is_finite() {
        (-rank).max(0.0)
    } else {
        999.0
    };
    (1.0 / (1.0 + penalty)) as f32
}

/// Turn free text into a safe FTS5 query.
///
/// Anything that is not a letter, number or whitespace (in any script)
/// becomes a separator, the same way the unicode61 tokenizer splits indexed
/// text. Each remaining token is quoted and the tokens are AND-ed. Returns
/// `None` when nothing searchable is left.
pub fn sanitize_fts_query(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    let tokens: Vec<String> = cleaned
        .split_whitespace()
        .map(|token| format!("\"{token}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" AND "))
    }
}

pub fn truncate_snippet(text: &str) -> String {
    text.chars().take(SNIPPET_MAX_CHARS).collect()
}

/// Scan every chunk embedded with `model`, keep positive similarities, best
/// first, at most `limit`.
pub async fn vector_search(
    store: &dyn MemoryStore,
    model: &str,
    query_embedding: &[f32],
    limit: usize,
) -> anyhow::Result<Vec<Candidate>> {
    let chunks = store.list_embedded_chunks(model).await?;

    let mut scored: Vec<Candidate> = chunks
        .into_iter()
        .filter_map(|chunk| {
            let similarity = cosine_similarity(query_embedding, chunk.embedding.as_deref()?);
            (similarity > 0.0).then(|| Candidate::from_chunk(chunk, similarity))
        })
        .collect();

    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(limit);
    Ok(scored)
}

/// Ranked full-text candidates. `Ok(None)` when the index is unavailable.
pub async fn keyword_search(
    store: &dyn MemoryStore,
    query: &str,
    limit: usize,
) -> anyhow::Result<Option<Vec<Candidate>>> {
    if !store.fts_available() {
        return Ok(None);
    }
    let Some(fts_query) = sanitize_fts_query(query) else {
        return Ok(Some(Vec::new()));
    };
    let matches = store.keyword_search(&fts_query, limit).await?;
    Ok(matches.map(|m| m.into_iter().map(Candidate::from_keyword).collect()))
}

/// Merge vector and keyword candidates.
///
/// Weights are normalized to sum to 1. Vector hits seed the merged set with
/// `vector_score * vector_weight`; a keyword hit on a chunk already present
/// adds `text_score * text_weight`, otherwise it enters with that alone.
/// Sorting is stable, so equal scores keep first-seen order. Results below
/// `min_score` are dropped, then the list is cut to `max_results`.
pub fn merge_hybrid(
    vector: Vec<Candidate>,
    keyword: Vec<Candidate>,
    config: &SearchConfig,
) -> Vec<SearchResult> {
    let (vector_weight, text_weight) = config.normalized_weights();

    let mut merged: Vec<SearchResult> = Vec::with_capacity(vector.len() + keyword.len());
    let mut by_id: HashMap<String, usize> = HashMap::new();

    for candidate in vector {
        if by_id.contains_key(&candidate.chunk_id) {
            continue;
        }
        let raw = candidate.score;
        let mut result = candidate.into_result(raw * vector_weight);
        result.vector_score = Some(raw);
        by_id.insert(result.chunk_id.clone(), merged.len());
        merged.push(result);
    }

    for candidate in keyword {
        let raw = candidate.score;
        match by_id.get(&candidate.chunk_id) {
            Some(&idx) => {
                let existing = &mut merged[idx];
                if existing.text_score.is_none() {
                    existing.score += raw * text_weight;
                    existing.text_score = Some(raw);
                }
            },
            None => {
                let mut result = candidate.into_result(raw * text_weight);
                result.text_score = Some(raw);
                by_id.insert(result.chunk_id.clone(), merged.len());
                merged.push(result);
            },
        }
    }

    merged.sort_by(|a, b| b.score.total_cmp(&a.score));
    merged.retain(|r| r.score >= config.min_score);
    merged.truncate(config.max_results);
    merged
}

/// Run both sub-searches concurrently and merge them.
pub async fn hybrid_search(
    store: &dyn MemoryStore,
    embedder: &CachedEmbedder,
    query: &str,
    config: &SearchConfig,
) -> anyhow::Result<Vec<SearchResult>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }
    let limit = config.candidate_limit();

    let vector_part = async {
        match embedder.embed_one(query).await {
            Ok(query_embedding) => {
                vector_search(store, embedder.model_name(), &query_embedding, limit)
                    .await
                    .map(Some)
            },
            Err(e) => {
                debug!(error = %e, "vector search skipped");
                Ok(None)
            },
        }
    };
    let keyword_part = keyword_search(store, query, limit);

    let (vector, keyword) = tokio::join!(vector_part, keyword_part);
    let vector = vector?.unwrap_or_default();
    let keyword = keyword?.unwrap_or_else(|| {
        debug!("keyword search skipped, full-text index unavailable");
        Vec::new()
    });

    debug!(
        vector_hits = vector.len(),
        keyword_hits = keyword.len(),
        "hybrid search candidates"
    );
    Ok(merge_hybrid(vector, keyword, config))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::test_support::{
            KeywordEmbedder, keyword_embedding, memory_store, memory_store_with_full_text,
        },
        rstest::rstest,
    };

    fn candidate(id: &str, score: f32) -> Candidate {
        Candidate {
            chunk_id: id.into(),
            path: format!("{id}.md"),
            source: "memory".into(),
            start_line: 1,
            end_line: 1,
            text: format!("text of {id}"),
            score,
        }
    }

    fn chunk(id: &str, text: &str) -> ChunkRow {
        ChunkRow {
            id: id.into(),
            path: format!("{id}.md"),
            source: "memory".into(),
            start_line: 1,
            end_line: 1,
            hash: crate::hash::sha256_hex(text),
            model: "mock-model".into(),
            text: text.into(),
            embedding: Some(keyword_embedding(text)),
            updated_at: 0,
        }
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[rstest]
    #[case(0.0, 1.0)]
    #[case(-1.0, 0.5)]
    #[case(-3.0, 0.25)]
    #[case(2.5, 1.0)]
    fn rank_to_score(#[case] rank: f64, #[case] expected: f32) {
        assert!((bm25_rank_to_score(rank) - expected).abs() < 1e-6);
    }

    #[test]
    fn rank_to_score_handles_non_finite() {
        assert!(bm25_rank_to_score(f64::NAN) < 0.01);
        assert!(bm25_rank_to_score(f64::NEG_INFINITY) < 0.01);
    }

    #[rstest]
    #[case("quarterly report", Some("\"quarterly\" AND \"report\""))]
    #[case("what's \"up\"?", Some("\"what\" AND \"s\" AND \"up\""))]
    #[case("NEAR(a b) OR c*", Some("\"NEAR\" AND \"a\" AND \"b\" AND \"OR\" AND \"c\""))]
    #[case("café 東京 2024", Some("\"café\" AND \"東京\" AND \"2024\""))]
    #[case("  ?!*  ", None)]
    #[case("", None)]
    fn sanitizes_queries(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(sanitize_fts_query(raw).as_deref(), expected);
    }

    #[test]
    fn snippet_is_truncated_by_chars() {
        let long = "é".repeat(SNIPPET_MAX_CHARS + 50);
        assert_eq!(truncate_snippet(&long).chars().count(), SNIPPET_MAX_CHARS);
        assert_eq!(truncate_snippet("short"), "short");
    }

    #[test]
    fn chunk_found_by_both_signals_scores_higher() {
        let config = SearchConfig {
            min_score: 0.0,
            ..SearchConfig::default()
        };
        let both = merge_hybrid(vec![candidate("a", 0.8)], vec![candidate("a", 0.6)], &config);
        let vector_only = merge_hybrid(vec![candidate("a", 0.8)], vec![], &config);
        let keyword_only = merge_hybrid(vec![], vec![candidate("a", 0.6)], &config);

        assert_eq!(both.len(), 1);
        assert!(both[0].score > vector_only[0].score);
        assert!(both[0].score > keyword_only[0].score);
        assert!((both[0].score - (0.8 * 0.7 + 0.6 * 0.3)).abs() < 1e-6);
        assert_eq!(both[0].vector_score, Some(0.8));
        assert_eq!(both[0].text_score, Some(0.6));
    }

    #[test]
    fn merge_normalizes_weights() {
        let config = SearchConfig {
            min_score: 0.0,
            vector_weight: 7.0,
            text_weight: 3.0,
            ..SearchConfig::default()
        };
        let merged = merge_hybrid(vec![candidate("a", 1.0)], vec![candidate("b", 1.0)], &config);
        assert!((merged[0].score - 0.7).abs() < 1e-6);
        assert!((merged[1].score - 0.3).abs() < 1e-6);
    }

    #[test]
    fn merge_filters_then_truncates() {
        let config = SearchConfig {
            max_results: 2,
            min_score: 0.2,
            ..SearchConfig::default()
        };
        let merged = merge_hybrid(
            vec![candidate("a", 0.9), candidate("b", 0.5), candidate("c", 0.1)],
            vec![candidate("d", 0.9)],
            &config,
        );
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().all(|r| r.score >= config.min_score));
        assert_eq!(merged[0].chunk_id, "a");
        assert_eq!(merged[1].chunk_id, "b");
    }

    #[test]
    fn equal_scores_keep_first_seen_order() {
        let config = SearchConfig {
            min_score: 0.0,
            vector_weight: 0.5,
            text_weight: 0.5,
            ..SearchConfig::default()
        };
        let merged = merge_hybrid(
            vec![candidate("v1", 0.4), candidate("v2", 0.4)],
            vec![candidate("k1", 0.4)],
            &config,
        );
        let ids: Vec<_> = merged.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["v1", "v2", "k1"]);
    }

    #[tokio::test]
    async fn vector_search_keeps_positive_similarities() {
        let store = memory_store().await;
        store
            .upsert_chunks(&[
                chunk("r", "rust and memory"),
                chunk("c", "cooking dinner"),
                chunk("n", "nothing relevant"),
            ])
            .await
            .unwrap();

        let hits = vector_search(store.as_ref(), "mock-model", &keyword_embedding("rust"), 10)
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["r"]);
        assert!(hits[0].score > 0.0);
    }

    #[tokio::test]
    async fn keyword_search_is_none_without_index() {
        let store = memory_store_with_full_text(false).await;
        assert!(keyword_search(store.as_ref(), "rust", 5).await.unwrap().is_none());

        let store = memory_store().await;
        let hits = keyword_search(store.as_ref(), "?!", 5).await.unwrap();
        assert_eq!(hits, Some(Vec::new()));
    }

    #[tokio::test]
    async fn hybrid_search_degrades_to_keywords_only() {
        let store = memory_store().await;
        store
            .upsert_chunks(&[chunk("r", "rust is fast"), chunk("p", "python is friendly")])
            .await
            .unwrap();
        let (provider, handle) = KeywordEmbedder::new();
        handle.set_available(false);
        let embedder = CachedEmbedder::new(Box::new(provider), store.clone());

        let results = hybrid_search(store.as_ref(), &embedder, "rust", &SearchConfig::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "r");
        assert_eq!(results[0].vector_score, None);
        assert!(results[0].text_score.is_some());
    }

    #[tokio::test]
    async fn hybrid_search_degrades_to_vectors_only() {
        let store = memory_store_with_full_text(false).await;
        store
            .upsert_chunks(&[chunk("r", "rust is fast"), chunk("p", "python is friendly")])
            .await
            .unwrap();
        let (provider, _handle) = KeywordEmbedder::new();
        let embedder = CachedEmbedder::new(Box::new(provider), store.clone());

        let results = hybrid_search(store.as_ref(), &embedder, "python", &SearchConfig::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "p");
        assert_eq!(results[0].text_score, None);
    }

    #[tokio::test]
    async fn hybrid_search_with_nothing_available_is_empty() {
        let store = memory_store_with_full_text(false).await;
        store.upsert_chunks(&[chunk("r", "rust")]).await.unwrap();
        let (provider, handle) = KeywordEmbedder::new();
        handle.set_failing(true);
        let embedder = CachedEmbedder::new(Box::new(provider), store.clone());

        let results = hybrid_search(store.as_ref(), &embedder, "rust", &SearchConfig::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn malformed_row_does_not_abort_search() {
        let store = memory_store().await;
        store.upsert_chunks(&[chunk("good", "rust memory")]).await.unwrap();
        sqlx::query(
            "INSERT INTO chunks (id, path, source, start_line, end_line, hash, model, text, embedding, updated_at)
             VALUES ('bad', 'bad.md', 'memory', 1, 1, 'h', 'mock-model', 'rust broken', X'00', 0)",
        )
        .execute(store.pool())
        .await
        .unwrap();
        let (provider, _handle) = KeywordEmbedder::new();
        let embedder = CachedEmbedder::new(Box::new(provider), store.clone());

        let results = hybrid_search(store.as_ref(), &embedder, "rust", &SearchConfig::default())
            .await
            .unwrap();
        assert_eq!(results[0].chunk_id, "good");
        assert!(results[0].vector_score.is_some());
    }
}
