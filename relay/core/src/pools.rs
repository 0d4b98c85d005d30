//! Worker Pools
//!
//! Two dedicated runtimes keep model I/O and store writes off the caller's
//! executor:
//!
//! - **outbound**: drives token sources and the reasoning filter
//! - **storage**: runs conversation store calls via `spawn_blocking`
//!
//! Pools are built once at startup and shared behind an `Arc`.

use std::fmt;
use std::io;

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::info;

use crate::config::PoolConfig;

/// Handles to the outbound and storage executors
pub struct WorkerPools {
    outbound: Handle,
    storage: Handle,
    owned: Vec<Runtime>,
}

impl WorkerPools {
    /// Start both pools with the configured thread counts
    ///
    /// # Errors
    ///
    /// Returns an error if either runtime fails to start.
    pub fn build(config: &PoolConfig) -> io::Result<Self> {
        let outbound = Builder::new_multi_thread()
            .worker_threads(config.outbound_threads)
            .thread_name("relay-outbound")
            .enable_all()
            .build()?;
        let storage = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.storage_threads)
            .thread_name("relay-storage")
            .enable_all()
            .build()?;

        info!(
            outbound_threads = config.outbound_threads,
            storage_threads = config.storage_threads,
            "Worker pools started"
        );

        Ok(Self {
            outbound: outbound.handle().clone(),
            storage: storage.handle().clone(),
            owned: vec![outbound, storage],
        })
    }

    /// Use existing runtimes without taking ownership of them
    #[must_use]
    pub fn from_handles(outbound: Handle, storage: Handle) -> Self {
        Self {
            outbound,
            storage,
            owned: Vec::new(),
        }
    }

    /// Run everything on the current runtime
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        let handle = Handle::current();
        Self::from_handles(handle.clone(), handle)
    }

    /// Executor for model I/O
    #[must_use]
    pub fn outbound(&self) -> &Handle {
        &self.outbound
    }

    /// Executor for store calls
    #[must_use]
    pub fn storage(&self) -> &Handle {
        &self.storage
    }
}

impl fmt::Debug for WorkerPools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPools")
            .field("owned_runtimes", &self.owned.len())
            .finish_non_exhaustive()
    }
}

impl Drop for WorkerPools {
    fn drop(&mut self) {
        // Dropping a Runtime inside async context panics
        for runtime in self.owned.drain(..) {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_run() {
        let pools = WorkerPools::build(&PoolConfig::default()).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        pools.outbound().spawn(async move {
            tx.send(std::thread::current().name().map(str::to_owned)).unwrap();
        });
        let name = rx.recv().unwrap();
        assert_eq!(name.as_deref(), Some("relay-outbound"));
    }

    #[tokio::test]
    async fn test_storage_runs_blocking_work() {
        let pools = WorkerPools::build(&PoolConfig::default()).unwrap();
        let value = pools.storage().spawn_blocking(|| 21 * 2).await.unwrap();
        assert_eq!(value, 42);
        // Dropped inside async context
        drop(pools);
    }

    #[tokio::test]
    async fn test_current_borrows_runtime() {
        let pools = WorkerPools::current();
        let value = pools.outbound().spawn(async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }
}
