//! Model Backend Integration
//!
//! Token sources open one streamed reply per query from a model backend
//! through the [`TokenSource`] trait.
//!
//! # Available Backends
//!
//! - **Ollama**: Local or remote Ollama server (`/api/generate`)
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::backend::{OllamaSource, TokenSource};
//! use relay_core::config::BackendConfig;
//!
//! let source = OllamaSource::new(&BackendConfig::default())?;
//! let mut tokens = source.open("Hello!").await?;
//! ```

mod ollama;
mod traits;

pub use ollama::OllamaSource;
pub use traits::{RawTokenStream, TokenSource};
