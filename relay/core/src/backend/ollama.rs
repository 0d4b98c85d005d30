//! Ollama Token Source
//!
//! Streams completions from an Ollama server.
//!
//! # Ollama API
//!
//! `/api/generate` with `"stream": true` answers with newline-delimited JSON:
//!
//! ```text
//! {"response":"Hel","done":false}
//! {"response":"lo","done":false}
//! {"response":"","done":true}
//! ```
//!
//! A line carrying an `"error"` field ends the stream with a failure.

use std::ops::ControlFlow;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::traits::{RawTokenStream, TokenSource};
use crate::config::BackendConfig;
use crate::error::RelayError;

/// Tokens buffered between the HTTP reader and the consumer
const TOKEN_CHANNEL_CAPACITY: usize = 100;

type TokenSender = mpsc::Sender<anyhow::Result<String>>;

/// Ollama backend client
#[derive(Clone, Debug)]
pub struct OllamaSource {
    /// Host address
    host: String,
    /// Port number
    port: u16,
    /// Model to query
    model: String,
    /// Optional sampling temperature
    temperature: Option<f32>,
    /// Optional system prompt
    system_prompt: Option<String>,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaSource {
    /// Create a source from backend configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            model: config.model.clone(),
            temperature: config.temperature,
            system_prompt: config.system_prompt.clone(),
            http_client,
        })
    }

    /// Get the base URL
    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Get generate endpoint URL
    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url())
    }

    /// Get tags endpoint URL
    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url())
    }

    /// Build the JSON body for a streaming generation
    fn request_body(&self, query: &str) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "prompt": query,
            "stream": true,
        });

        if let Some(ref system) = self.system_prompt {
            body["system"] = serde_json::json!(system);
        }
        if let Some(temperature) = self.temperature {
            body["options"] = serde_json::json!({ "temperature": temperature });
        }

        body
    }
}

/// One parsed NDJSON line
#[derive(Debug, PartialEq)]
enum GenerateLine {
    /// A fragment of the reply (possibly empty)
    Token(String),
    /// Final line
    Done,
    /// Backend-reported failure
    Failed(String),
}

fn parse_line(line: &str) -> Option<GenerateLine> {
    let data: serde_json::Value = match serde_json::from_str(line) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "Skipping unparseable Ollama line");
            return None;
        }
    };

    if let Some(error) = data.get("error").and_then(|e| e.as_str()) {
        return Some(GenerateLine::Failed(error.to_string()));
    }
    if data
        .get("done")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
    {
        return Some(GenerateLine::Done);
    }
    data.get("response")
        .and_then(|r| r.as_str())
        .map(|token| GenerateLine::Token(token.to_string()))
}

/// Forward tokens from an NDJSON body until the done line
///
/// Chunks are split on raw newlines before decoding, so a multi-byte
/// character spanning two chunks arrives intact. A body that ends without a
/// done line is a failure.
async fn forward_generation<S, B, E>(mut body: S, tx: TokenSender)
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = body.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx.send(Err(anyhow::Error::new(e))).await;
                return;
            }
        };
        buffer.extend_from_slice(bytes.as_ref());

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            if forward_line(&line, &tx).await.is_break() {
                return;
            }
        }
    }

    // The last line may arrive without its newline
    if !buffer.is_empty() && forward_line(&buffer, &tx).await.is_break() {
        return;
    }

    warn!("Ollama stream ended without done signal");
    let _ = tx
        .send(Err(anyhow::anyhow!("Ollama stream ended before completion")))
        .await;
}

/// Forward one raw line; `Break` ends the generation
async fn forward_line(line: &[u8], tx: &TokenSender) -> ControlFlow<()> {
    let line = match std::str::from_utf8(line) {
        Ok(line) => line.trim(),
        Err(e) => {
            warn!(error = %e, "Skipping non-UTF-8 Ollama line");
            return ControlFlow::Continue(());
        }
    };
    if line.is_empty() {
        return ControlFlow::Continue(());
    }

    match parse_line(line) {
        Some(GenerateLine::Token(token)) if token.is_empty() => ControlFlow::Continue(()),
        Some(GenerateLine::Token(token)) => {
            if tx.send(Ok(token)).await.is_err() {
                debug!("Token receiver dropped, abandoning generation");
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        }
        Some(GenerateLine::Done) => ControlFlow::Break(()),
        Some(GenerateLine::Failed(message)) => {
            let _ = tx.send(Err(anyhow::anyhow!(message))).await;
            ControlFlow::Break(())
        }
        None => ControlFlow::Continue(()),
    }
}

#[async_trait]
impl TokenSource for OllamaSource {
    fn name(&self) -> &'static str {
        "Ollama"
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    async fn open(&self, query: &str) -> anyhow::Result<RawTokenStream> {
        if query.trim().is_empty() {
            return Err(RelayError::Validation("query must not be empty".to_string()).into());
        }

        let response = self
            .http_client
            .post(self.generate_url())
            .json(&self.request_body(query))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama returned {status}: {body}");
        }

        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        tokio::spawn(forward_generation(response.bytes_stream(), tx));

        Ok(ReceiverStream::new(rx).boxed())
    }
}
