//! Multicast Actor
//!
//! Fans one upstream out to a fixed set of branches.

use futures::future;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};

/// One downstream view of a fanned-out stream
pub type Branch<T> = ReceiverStream<T>;

/// Split `upstream` into `N` branches that each see every item in order
///
/// The upstream is polled by a background task for as long as at least one
/// branch is still attached. A branch detaches by being dropped; once all
/// have gone the task stops and drops the upstream. Each item is delivered to
/// every attached branch before the next one is pulled, so the slowest
/// attached branch paces the upstream.
///
/// # Panics
///
/// Panics if called outside a tokio runtime.
pub fn fan_out<T, const N: usize>(upstream: BoxStream<'static, T>, capacity: usize) -> [Branch<T>; N]
where
    T: Clone + Send + 'static,
{
    let mut senders = Vec::with_capacity(N);
    let branches = std::array::from_fn(|_| {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        senders.push(tx);
        ReceiverStream::new(rx)
    });

    tokio::spawn(run(upstream, senders));
    branches
}

async fn run<T>(mut upstream: BoxStream<'static, T>, mut senders: Vec<mpsc::Sender<T>>)
where
    T: Clone + Send + 'static,
{
    let mut delivered = 0u64;

    loop {
        senders.retain(|tx| !tx.is_closed());
        if senders.is_empty() {
            debug!(delivered, "All branches detached, releasing upstream");
            return;
        }

        let item = tokio::select! {
            item = upstream.next() => item,
            () = all_closed(&senders) => continue,
        };
        let Some(item) = item else {
            debug!(delivered, "Upstream finished");
            return;
        };

        for tx in &senders {
            if tx.send(item.clone()).await.is_err() {
                trace!("Branch detached during delivery");
            }
        }
        delivered += 1;
    }
}

async fn all_closed<T>(senders: &[mpsc::Sender<T>]) {
    future::join_all(senders.iter().map(|tx| tx.closed())).await;
}
