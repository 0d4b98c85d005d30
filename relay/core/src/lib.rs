//! Relay Core - Streaming Chat Turns
//!
//! This crate relays a user's query to a language model and streams the
//! reply back token by token, while saving the full reply once it has
//! finished. It has no transport of its own; a server (see `relay-daemon`)
//! renders the frames it produces as server-sent events.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         TurnCoordinator                           │
//! │                                                                   │
//! │  validate ─▶ ConversationStore ─▶ user message ─▶ ModelTransport  │
//! │                (storage pool)      (storage pool)       │         │
//! │                                                         ▼         │
//! │                              ┌──────────────────────────────────┐ │
//! │                              │  TokenSource ─▶ ReasoningFilter  │ │
//! │                              │         (outbound pool)          │ │
//! │                              └────────────────┬─────────────────┘ │
//! │                                               │                   │
//! │                                         fan_out (N = 2)           │
//! │                                      ┌────────┴────────┐          │
//! │                                      ▼                 ▼          │
//! │                               WireFrame stream   PersistenceSink  │
//! │                                  (client)         (storage pool)  │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`TurnCoordinator`]: runs one chat turn and yields its [`WireFrame`]s
//! - [`ModelTransport`]: deferred, filtered token stream for a query
//! - [`ReasoningFilter`]: strips reasoning segments and blank fragments
//! - [`PersistenceSink`]: saves the reply; [`EndOfStreamSave`] by default
//! - [`ActiveRequestGauge`]: in-flight model requests
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use relay_core::{
//!     backend::OllamaSource, config::load_config, ActiveRequestGauge, EndOfStreamSave,
//!     InMemoryStore, ModelTransport, PersistenceHealth, ReasoningFilter, TurnCoordinator,
//!     WorkerPools,
//! };
//!
//! let config = load_config()?;
//! let pools = Arc::new(WorkerPools::build(&config.pools)?);
//! let store = Arc::new(InMemoryStore::new());
//! let source = Arc::new(OllamaSource::new(&config.backend)?);
//!
//! let transport = ModelTransport::new(
//!     source,
//!     ReasoningFilter::new(config.reasoning.clone()),
//!     ActiveRequestGauge::global(),
//!     Arc::clone(&pools),
//! );
//! let sink = Arc::new(EndOfStreamSave::new(
//!     store.clone(),
//!     Arc::new(PersistenceHealth::new(config.health.clone())),
//!     Arc::clone(&pools),
//! ));
//! let coordinator = TurnCoordinator::new(store, transport, sink, pools);
//!
//! let mut frames = coordinator.stream_turn("Hello!", None, "alice");
//! while let Some(frame) = frames.next().await {
//!     print!("{}", frame?.to_sse()?);
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: Token sources (Ollama)
//! - [`config`]: Layered configuration (defaults, TOML, environment, CLI)
//! - [`coordinator`]: Per-turn state machine
//! - [`error`]: Error types
//! - [`messages`]: Wire frames and message roles
//! - [`metrics`]: Request gauge and persistence health
//! - [`persistence`]: Reply persistence strategies
//! - [`pools`]: Outbound and storage worker pools
//! - [`reasoning`]: Reasoning markup filter
//! - [`store`]: Conversation storage
//! - [`streaming`]: Multicast fan-out
//! - [`transport`]: Filtered token streams

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod messages;
pub mod metrics;
pub mod persistence;
pub mod pools;
pub mod reasoning;
pub mod store;
pub mod streaming;
pub mod transport;

// Re-exports for convenience
pub use backend::{OllamaSource, RawTokenStream, TokenSource};
pub use coordinator::{conversation_title, FrameStream, TurnCoordinator};
pub use error::RelayError;
pub use messages::{EventKind, FrameId, FramePayload, MessageRole, WireFrame};
pub use metrics::{
    ActiveRequestGauge, ActiveRequestGuard, HealthStatus, PersistenceHealth, PersistenceMetrics,
};
pub use persistence::{EndOfStreamSave, PersistenceSink};
pub use pools::WorkerPools;
pub use reasoning::{FilterMode, ReasoningFilter};
pub use store::{Conversation, ConversationStore, FileStore, InMemoryStore, StoreError, StoredMessage};
pub use streaming::fan_out;
pub use transport::{FilteredTokens, ModelTransport};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, RelayConfig,
};
