//! Reasoning Filter
//!
//! Strips "thinking" segments and blank fragments from a token stream.
//!
//! Markers are matched against whole tokens: a token equal to the start
//! marker opens a reasoning segment, a token equal to the end marker closes
//! it, and neither marker is ever emitted. Everything inside a segment is
//! dropped. A segment that is never closed swallows the rest of the stream.
//!
//! Blank suppression drops a token only when it trims to nothing *and* is at
//! most one character long, so `" "` disappears but `"\n\n"` (paragraph
//! breaks) survives.

use futures::{future, Stream, StreamExt};

use crate::config::ReasoningConfig;

/// Per-invocation filter state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterMode {
    /// Tokens are emitted
    #[default]
    Normal,
    /// Inside a reasoning segment; tokens are dropped
    Reasoning,
}

/// Removes reasoning markup and blank fragments from token streams
///
/// The filter holds configuration only. Each call to [`filter`](Self::filter)
/// starts a fresh [`FilterMode::Normal`] state owned by the returned stream,
/// so one filter can serve any number of concurrent turns.
#[derive(Clone, Debug, Default)]
pub struct ReasoningFilter {
    config: ReasoningConfig,
}

impl ReasoningFilter {
    /// Create a filter from configuration
    #[must_use]
    pub fn new(config: ReasoningConfig) -> Self {
        Self { config }
    }

    /// Whether reasoning markers are honoured
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Filter a stream of fallible tokens
    ///
    /// Errors pass through untouched and in order; the filter adds none of
    /// its own.
    pub fn filter<S, E>(
        &self,
        tokens: S,
        suppress_blanks: bool,
    ) -> impl Stream<Item = Result<String, E>> + Send + 'static
    where
        S: Stream<Item = Result<String, E>> + Send + 'static,
        E: Send + 'static,
    {
        let filter = self.clone();
        let mut mode = FilterMode::Normal;

        tokens.filter_map(move |item| {
            let out = match item {
                Ok(token) => filter.step(&mut mode, token, suppress_blanks).map(Ok),
                Err(e) => Some(Err(e)),
            };
            future::ready(out)
        })
    }

    /// Advance `mode` by one token, returning the token if it survives
    pub fn step(&self, mode: &mut FilterMode, token: String, suppress_blanks: bool) -> Option<String> {
        if self.config.enabled {
            if token == self.config.start_marker {
                *mode = FilterMode::Reasoning;
                return None;
            }
            if token == self.config.end_marker {
                *mode = FilterMode::Normal;
                return None;
            }
            if *mode == FilterMode::Reasoning {
                return None;
            }
        }

        if suppress_blanks && is_droppable_blank(&token) {
            return None;
        }
        Some(token)
    }
}

/// A blank token of at most one character
fn is_droppable_blank(token: &str) -> bool {
    token.trim().is_empty() && token.chars().count() <= 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use pretty_assertions::assert_eq;

    fn think_filter() -> ReasoningFilter {
        ReasoningFilter::new(ReasoningConfig::with_markers("<think>", "</think>"))
    }

    async fn run(filter: &ReasoningFilter, tokens: &[&str], suppress_blanks: bool) -> Vec<String> {
        let input = stream::iter(
            tokens
                .iter()
                .map(|t| Ok::<_, String>((*t).to_string()))
                .collect::<Vec<_>>(),
        );
        filter
            .filter(input, suppress_blanks)
            .map(|r| r.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_blank_boundary_without_markers() {
        let filter = ReasoningFilter::default();
        let out = run(&filter, &["a", " ", "", "\n", "  ", "\n\n", "b", "\u{3000}"], true).await;
        assert_eq!(out, vec!["a", "  ", "\n\n", "b"]);
    }

    #[tokio::test]
    async fn test_no_suppression_passes_everything() {
        let filter = ReasoningFilter::default();
        let out = run(&filter, &["a", " ", ""], false).await;
        assert_eq!(out, vec!["a", " ", ""]);
    }

    #[tokio::test]
    async fn test_disabled_filter_keeps_markers() {
        let filter = ReasoningFilter::default();
        let out = run(&filter, &["<think>", "x", "</think>"], true).await;
        assert_eq!(out, vec!["<think>", "x", "</think>"]);
    }

    #[tokio::test]
    async fn test_matched_markers_remove_inner_tokens() {
        let out = run(
            &think_filter(),
            &["before", "<think>", "secret", " ", "more", "</think>", "ok", " "],
            true,
        )
        .await;
        assert_eq!(out, vec!["before", "ok"]);
    }

    #[tokio::test]
    async fn test_unterminated_section_suppresses_rest() {
        let out = run(&think_filter(), &["a", "<think>", "b", "c", "d"], true).await;
        assert_eq!(out, vec!["a"]);
    }

    #[tokio::test]
    async fn test_stray_end_marker_is_dropped() {
        let out = run(&think_filter(), &["a", "</think>", "b"], true).await;
        assert_eq!(out, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_markers_match_whole_tokens_only() {
        let out = run(&think_filter(), &["<think>x", "y"], true).await;
        assert_eq!(out, vec!["<think>x", "y"]);
    }

    #[tokio::test]
    async fn test_each_invocation_starts_normal() {
        let filter = think_filter();
        let first = run(&filter, &["<think>", "hidden"], true).await;
        let second = run(&filter, &["visible"], true).await;

        assert!(first.is_empty());
        assert_eq!(second, vec!["visible"]);
    }

    #[tokio::test]
    async fn test_error_propagates_after_emitted_tokens() {
        let input = stream::iter(vec![
            Ok("a".to_string()),
            Ok("<think>".to_string()),
            Ok("b".to_string()),
            Err("boom".to_string()),
            Ok("c".to_string()),
        ]);
        let out: Vec<Result<String, String>> = think_filter().filter(input, true).collect().await;

        assert_eq!(
            out,
            vec![Ok("a".to_string()), Err("boom".to_string())],
        );
    }

    #[test]
    fn test_step_tracks_mode() {
        let filter = think_filter();
        let mut mode = FilterMode::Normal;

        assert_eq!(filter.step(&mut mode, "<think>".to_string(), true), None);
        assert_eq!(mode, FilterMode::Reasoning);
        assert_eq!(filter.step(&mut mode, "x".to_string(), true), None);
        assert_eq!(filter.step(&mut mode, "</think>".to_string(), true), None);
        assert_eq!(mode, FilterMode::Normal);
        assert_eq!(
            filter.step(&mut mode, "y".to_string(), true),
            Some("y".to_string())
        );
    }
}
