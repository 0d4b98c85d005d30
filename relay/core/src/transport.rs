//! Model Transport
//!
//! Turns a query into the filtered token stream for one turn.
//!
//! Nothing happens until the returned stream is first polled. At that point
//! the transport takes a unit of the [`ActiveRequestGauge`], spawns the
//! acquire-and-filter pipeline on the outbound pool and hands back the
//! receiving end of a bounded channel. The pipeline owns the gauge guard, so
//! the unit is returned whether the source completes, fails, panics or the
//! consumer walks away.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, debug_span, error, warn, Instrument};
use uuid::Uuid;

use crate::backend::TokenSource;
use crate::error::RelayError;
use crate::metrics::{ActiveRequestGauge, ActiveRequestGuard};
use crate::pools::WorkerPools;
use crate::reasoning::ReasoningFilter;

/// Filtered tokens for one turn; an `Err` item ends the stream
pub type FilteredTokens = BoxStream<'static, Result<String, RelayError>>;

type TokenSender = mpsc::Sender<Result<String, RelayError>>;

/// Default capacity of the channel between the pipeline and its consumer
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Opens filtered token streams against a [`TokenSource`]
#[derive(Clone)]
pub struct ModelTransport {
    source: Arc<dyn TokenSource>,
    filter: ReasoningFilter,
    gauge: ActiveRequestGauge,
    pools: Arc<WorkerPools>,
    channel_capacity: usize,
}

impl ModelTransport {
    /// Create a transport
    #[must_use]
    pub fn new(
        source: Arc<dyn TokenSource>,
        filter: ReasoningFilter,
        gauge: ActiveRequestGauge,
        pools: Arc<WorkerPools>,
    ) -> Self {
        Self {
            source,
            filter,
            gauge,
            pools,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Set the pipeline channel capacity (at least 1)
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// The gauge this transport reports to
    #[must_use]
    pub fn gauge(&self) -> &ActiveRequestGauge {
        &self.gauge
    }

    /// Deferred, filtered token stream for `query`
    ///
    /// Setup failures arrive as the only item: validation-class errors
    /// unchanged, everything else as [`RelayError::ResponseFailed`]. A
    /// failure after tokens have flowed arrives as [`RelayError::Upstream`]
    /// and ends the stream.
    pub fn create_filtered_stream(&self, query: &str, conversation_id: Uuid) -> FilteredTokens {
        let source = Arc::clone(&self.source);
        let filter = self.filter.clone();
        let gauge = self.gauge.clone();
        let outbound = self.pools.outbound().clone();
        let capacity = self.channel_capacity;
        let query = query.to_owned();

        stream::once(async move {
            let (tx, rx) = mpsc::channel(capacity);
            let guard = gauge.acquire();
            let span = debug_span!(
                "token_pipeline",
                %conversation_id,
                backend = source.name()
            );
            outbound.spawn(run_pipeline(source, filter, query, tx, guard).instrument(span));
            ReceiverStream::new(rx)
        })
        .flatten()
        .boxed()
    }
}

impl std::fmt::Debug for ModelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelTransport")
            .field("source", &self.source.name())
            .field("reasoning", &self.filter.is_enabled())
            .field("channel_capacity", &self.channel_capacity)
            .finish_non_exhaustive()
    }
}

async fn run_pipeline(
    source: Arc<dyn TokenSource>,
    filter: ReasoningFilter,
    query: String,
    tx: TokenSender,
    guard: ActiveRequestGuard,
) {
    let panic_tx = tx.clone();
    let outcome = AssertUnwindSafe(pump(source, filter, query, tx))
        .catch_unwind()
        .await;

    if outcome.is_err() {
        error!("Token pipeline panicked");
        let _ = panic_tx
            .send(Err(RelayError::Internal("token pipeline panicked".to_string())))
            .await;
    }
    drop(guard);
}

async fn pump(source: Arc<dyn TokenSource>, filter: ReasoningFilter, query: String, tx: TokenSender) {
    let opened = tokio::select! {
        opened = source.open(&query) => opened,
        () = tx.closed() => {
            debug!("Consumer detached before the source opened");
            return;
        }
    };

    let raw = match opened {
        Ok(raw) => raw,
        Err(err) => {
            let err = setup_error(err);
            warn!(error = %err, "Token source setup failed");
            let _ = tx.send(Err(err)).await;
            return;
        }
    };

    let tokens = raw.map(|item| item.map_err(|e| RelayError::Upstream(e.to_string())));
    let mut filtered = Box::pin(filter.filter(tokens, true));
    let mut forwarded = 0usize;

    loop {
        let next = tokio::select! {
            next = filtered.next() => next,
            () = tx.closed() => {
                debug!(forwarded, "Consumer detached, abandoning source");
                return;
            }
        };
        let Some(item) = next else {
            break;
        };

        let failed = item.is_err();
        if let Err(ref err) = item {
            warn!(forwarded, error = %err, "Token source failed mid-stream");
        }
        if tx.send(item).await.is_err() || failed {
            return;
        }
        forwarded += 1;
    }

    debug!(forwarded, "Token source completed");
}

/// Normalize a failure raised while opening the source
fn setup_error(err: anyhow::Error) -> RelayError {
    match err.downcast::<RelayError>() {
        Ok(RelayError::Validation(message)) => RelayError::Validation(message),
        Ok(other) => RelayError::response_failed(other.detail()),
        Err(err) => RelayError::response_failed(err.to_string()),
    }
}
