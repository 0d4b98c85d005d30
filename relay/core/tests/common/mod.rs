//! Shared fixtures for turn pipeline tests
//!
//! - [`ScriptedSource`]: token source driven by a [`Script`]
//! - [`RecordingStore`]: in-memory store with an operation log and failure
//!   injection
//! - [`RecordingMetrics`]: captures persistence failure reports
//! - [`Harness`]: a coordinator wired to all three

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use relay_core::config::ReasoningConfig;
use relay_core::{
    ActiveRequestGauge, Conversation, ConversationStore, EndOfStreamSave, FrameStream,
    InMemoryStore, MessageRole, ModelTransport, PersistenceMetrics, RawTokenStream,
    ReasoningFilter, RelayError, StoreError, StoredMessage, TokenSource, TurnCoordinator,
    WireFrame, WorkerPools,
};

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Ordered record of store and source operations
pub type EventLog = Arc<Mutex<Vec<String>>>;

// =============================================================================
// Token Source
// =============================================================================

/// What a [`ScriptedSource`] does when opened
pub enum Script {
    /// Emit these tokens, then complete
    Tokens(Vec<&'static str>),
    /// Fail to open with a plain error
    SetupError(&'static str),
    /// Fail to open with a validation error
    Invalid(&'static str),
    /// Emit these tokens, then fail
    MidStream(Vec<&'static str>, &'static str),
    /// Emit whatever the test pushes into the paired sender
    Channel(Mutex<Option<mpsc::Receiver<String>>>),
}

impl Script {
    /// A channel-driven script and the sender that feeds it
    pub fn channel() -> (Self, mpsc::Sender<String>) {
        let (tx, rx) = mpsc::channel(64);
        (Self::Channel(Mutex::new(Some(rx))), tx)
    }
}

/// Token source following a [`Script`]
pub struct ScriptedSource {
    script: Script,
    log: EventLog,
    opened: AtomicUsize,
}

impl ScriptedSource {
    /// Times `open` was called
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

fn owned(tokens: &[&str]) -> Vec<anyhow::Result<String>> {
    tokens.iter().map(|t| Ok((*t).to_string())).collect()
}

#[async_trait]
impl TokenSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open(&self, _query: &str) -> anyhow::Result<RawTokenStream> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push("open".to_string());

        match &self.script {
            Script::Tokens(tokens) => Ok(stream::iter(owned(tokens)).boxed()),
            Script::SetupError(message) => Err(anyhow::anyhow!(*message)),
            Script::Invalid(message) => Err(RelayError::Validation((*message).to_string()).into()),
            Script::MidStream(tokens, message) => {
                let mut items = owned(tokens);
                items.push(Err(anyhow::anyhow!(*message)));
                Ok(stream::iter(items).boxed())
            }
            Script::Channel(rx) => {
                let rx = rx
                    .lock()
                    .take()
                    .ok_or_else(|| anyhow::anyhow!("channel script opened twice"))?;
                Ok(ReceiverStream::new(rx).map(Ok).boxed())
            }
        }
    }
}

// =============================================================================
// Conversation Store
// =============================================================================

/// In-memory store that logs operations and can be told to fail
#[derive(Default)]
pub struct RecordingStore {
    inner: InMemoryStore,
    log: EventLog,
    fail_role: Mutex<Option<MessageRole>>,
    delete_before_append: AtomicBool,
    assistant_saved: Notify,
}

impl RecordingStore {
    /// Fail every append for `role` with an I/O error
    pub fn fail_appends_for(&self, role: MessageRole) {
        *self.fail_role.lock() = Some(role);
    }

    /// Delete the conversation just before every append
    pub fn delete_before_append(&self) {
        self.delete_before_append.store(true, Ordering::SeqCst);
    }

    /// Content of the assistant messages in `id`, oldest first
    pub fn replies(&self, id: Uuid) -> Vec<String> {
        self.messages(id, MessageRole::Assistant)
    }

    /// Content of the `role` messages in `id`, oldest first
    pub fn messages(&self, id: Uuid, role: MessageRole) -> Vec<String> {
        self.inner
            .get(id)
            .ok()
            .flatten()
            .map(|c| c.messages_by(role).map(|m| m.content.clone()).collect())
            .unwrap_or_default()
    }

    /// Title of conversation `id`
    pub fn title(&self, id: Uuid) -> String {
        self.inner
            .get(id)
            .ok()
            .flatten()
            .map(|c| c.title)
            .unwrap_or_default()
    }

    /// Wait until an assistant message has been written
    pub async fn wait_for_reply(&self) {
        tokio::time::timeout(TEST_TIMEOUT, self.assistant_saved.notified())
            .await
            .expect("reply was never saved");
    }
}

impl ConversationStore for RecordingStore {
    fn find_or_create(
        &self,
        id: Option<Uuid>,
        user_id: &str,
        title: &str,
    ) -> Result<Conversation, StoreError> {
        self.log.lock().push("find_or_create".to_string());
        self.inner.find_or_create(id, user_id, title)
    }

    fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        self.log.lock().push(format!("append:{role}"));

        if self.delete_before_append.load(Ordering::SeqCst) {
            self.inner.delete(conversation_id)?;
        }
        if *self.fail_role.lock() == Some(role) {
            return Err(StoreError::Io("disk full".to_string()));
        }

        let message = self.inner.append_message(conversation_id, role, content)?;
        if role == MessageRole::Assistant {
            self.assistant_saved.notify_one();
        }
        Ok(message)
    }

    fn get(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        self.inner.get(id)
    }

    fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        self.inner.delete(id)
    }
}

// =============================================================================
// Metrics
// =============================================================================

/// Captured persistence failure reports: (conversation, role, error kind)
#[derive(Default)]
pub struct RecordingMetrics {
    failures: Mutex<Vec<(Uuid, MessageRole, &'static str)>>,
}

impl RecordingMetrics {
    /// Reports so far
    pub fn failures(&self) -> Vec<(Uuid, MessageRole, &'static str)> {
        self.failures.lock().clone()
    }
}

impl PersistenceMetrics for RecordingMetrics {
    fn record_persistence_failure(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        error: &RelayError,
    ) {
        self.failures
            .lock()
            .push((conversation_id, role, error.kind()));
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A coordinator wired to recording collaborators
pub struct Harness {
    pub coordinator: TurnCoordinator,
    pub store: Arc<RecordingStore>,
    pub metrics: Arc<RecordingMetrics>,
    pub source: Arc<ScriptedSource>,
    pub gauge: ActiveRequestGauge,
    pub log: EventLog,
}

impl Harness {
    /// Harness with reasoning handling disabled
    pub fn new(script: Script) -> Self {
        Self::with_reasoning(script, ReasoningConfig::default())
    }

    /// Harness with the given reasoning configuration
    pub fn with_reasoning(script: Script, reasoning: ReasoningConfig) -> Self {
        let log = EventLog::default();
        let pools = Arc::new(WorkerPools::current());
        let store = Arc::new(RecordingStore {
            log: Arc::clone(&log),
            ..RecordingStore::default()
        });
        let metrics = Arc::new(RecordingMetrics::default());
        let source = Arc::new(ScriptedSource {
            script,
            log: Arc::clone(&log),
            opened: AtomicUsize::new(0),
        });
        let gauge = ActiveRequestGauge::new();

        let transport = ModelTransport::new(
            source.clone(),
            ReasoningFilter::new(reasoning),
            gauge.clone(),
            Arc::clone(&pools),
        );
        let sink = Arc::new(EndOfStreamSave::new(
            store.clone(),
            metrics.clone(),
            Arc::clone(&pools),
        ));
        let coordinator = TurnCoordinator::new(store.clone(), transport, sink, pools);

        Self {
            coordinator,
            store,
            metrics,
            source,
            gauge,
            log,
        }
    }

    /// Run a turn for `alice` to the end
    pub async fn run(&self, query: &str, conversation_id: Option<&str>) -> TurnResult {
        collect(self.coordinator.stream_turn(query, conversation_id, "alice")).await
    }

    /// Snapshot of the operation log
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Wait for the gauge to read `expected`
    pub async fn settle_gauge(&self, expected: i64) {
        tokio::time::timeout(TEST_TIMEOUT, async {
            while self.gauge.get() != expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("active request gauge did not settle");
    }
}

/// Frames of a finished turn and its terminal error, if any
#[derive(Debug)]
pub struct TurnResult {
    pub frames: Vec<WireFrame>,
    pub error: Option<RelayError>,
}

impl TurnResult {
    /// Content of every frame, in order
    pub fn contents(&self) -> Vec<&str> {
        self.frames.iter().map(|f| f.data.content.as_str()).collect()
    }

    /// Conversation the frames belong to
    pub fn conversation_id(&self) -> Uuid {
        self.frames
            .first()
            .expect("turn produced no frames")
            .data
            .conversation_id
    }
}

/// Drain a frame stream, stopping at the first error
pub async fn collect(mut frames: FrameStream) -> TurnResult {
    tokio::time::timeout(TEST_TIMEOUT, async move {
        let mut result = TurnResult {
            frames: Vec::new(),
            error: None,
        };
        while let Some(item) = frames.next().await {
            match item {
                Ok(frame) => result.frames.push(frame),
                Err(err) => {
                    result.error = Some(err);
                    break;
                }
            }
        }
        result
    })
    .await
    .expect("turn did not finish")
}
