//! Errors surfaced at the embedding boundary.
//!
//! Everything else in the crate reports through `anyhow`; embeddings get a
//! typed error so callers can tell "no provider configured" apart from "the
//! provider call failed" and degrade accordingly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// No usable credential or configuration for the provider.
    #[error("embedding provider '{provider}' is not available")]
    Unavailable { provider: String },

    /// Transport, HTTP status, quota or response decoding failure.
    #[error("embedding provider request failed: {0}")]
    Provider(#[source] anyhow::Error),

    /// The provider returned a different number of vectors than requested.
    #[error("embedding provider returned {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },

    /// Reading or writing the embedding cache failed.
    #[error("embedding cache error: {0}")]
    Store(#[source] anyhow::Error),
}

impl EmbeddingError {
    /// True when the failure means "not configured" rather than "broken".
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
