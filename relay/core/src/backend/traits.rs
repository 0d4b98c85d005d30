//! Token Source Trait
//!
//! A token source turns one query into a push-based sequence of text
//! fragments. It can fail in two places: while opening the sequence (the
//! returned `Result`) or part-way through (an `Err` item).

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Raw fragments as produced by the backend, in order
pub type RawTokenStream = BoxStream<'static, anyhow::Result<String>>;

/// Model backend producing a token stream per query
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Backend name (e.g. "Ollama")
    fn name(&self) -> &str;

    /// Check if the backend is reachable
    async fn health_check(&self) -> bool {
        true
    }

    /// Open the reply stream for `query`
    ///
    /// The stream ends when the backend signals completion. Dropping it
    /// abandons the generation.
    async fn open(&self, query: &str) -> anyhow::Result<RawTokenStream>;
}
