//! Relay Metrics
//!
//! Observability for the turn pipeline:
//! - In-flight model requests ([`ActiveRequestGauge`])
//! - Persistence failures and the health signal derived from them
//!   ([`PersistenceHealth`])

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::HealthConfig;
use crate::error::RelayError;
use crate::messages::MessageRole;

// ============================================================================
// Active Request Gauge
// ============================================================================

/// Count of token sources currently being consumed
///
/// Cloning shares the underlying counter. The only way to raise it is
/// [`acquire`](Self::acquire), whose guard lowers it again on drop, so every
/// increment is paired with exactly one decrement whatever way the holder
/// exits.
#[derive(Clone, Debug, Default)]
pub struct ActiveRequestGauge {
    active: Arc<AtomicI64>,
}

impl ActiveRequestGauge {
    /// Create a standalone gauge starting at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide gauge
    #[must_use]
    pub fn global() -> Self {
        static GLOBAL: OnceLock<ActiveRequestGauge> = OnceLock::new();
        GLOBAL.get_or_init(Self::new).clone()
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Increment, returning a guard that decrements when dropped
    #[must_use = "dropping the guard immediately releases the request"]
    pub fn acquire(&self) -> ActiveRequestGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveRequestGuard {
            active: Arc::clone(&self.active),
        }
    }

    /// Reset to zero (for the external metrics collector only)
    pub fn reset(&self) {
        self.active.store(0, Ordering::SeqCst);
    }
}

/// Holds one unit of an [`ActiveRequestGauge`]
#[derive(Debug)]
pub struct ActiveRequestGuard {
    active: Arc<AtomicI64>,
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Persistence Failure Reporting
// ============================================================================

/// Receiver of persistence failure reports
pub trait PersistenceMetrics: Send + Sync {
    /// Record that saving a message failed
    fn record_persistence_failure(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        error: &RelayError,
    );
}

/// Health derived from recent persistence failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    /// Below the warning threshold
    Healthy,
    /// At or above the warning threshold
    Warning,
    /// At or above the critical threshold
    Critical,
}

/// One recorded failure
#[derive(Clone, Debug)]
pub struct FailureRecord {
    /// Conversation whose message was lost
    pub conversation_id: Uuid,
    /// Role of the lost message
    pub role: MessageRole,
    /// Error tag (see [`RelayError::kind`])
    pub error_kind: &'static str,
    /// When the failure was recorded
    pub at: Instant,
}

/// Sliding-window persistence failure tracker
#[derive(Debug)]
pub struct PersistenceHealth {
    config: HealthConfig,
    recent: Mutex<VecDeque<FailureRecord>>,
    total_failures: AtomicU64,
}

impl Default for PersistenceHealth {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

impl PersistenceHealth {
    /// Create a tracker with the given thresholds
    #[must_use]
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            recent: Mutex::new(VecDeque::new()),
            total_failures: AtomicU64::new(0),
        }
    }

    /// Failures recorded since startup
    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Failures within the window
    #[must_use]
    pub fn recent_failures(&self) -> usize {
        let mut recent = self.recent.lock();
        Self::prune(&mut recent, self.config.window);
        recent.len()
    }

    /// Copy of the failures within the window, oldest first
    #[must_use]
    pub fn recent_records(&self) -> Vec<FailureRecord> {
        let mut recent = self.recent.lock();
        Self::prune(&mut recent, self.config.window);
        recent.iter().cloned().collect()
    }

    /// Current health
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        self.classify(self.recent_failures())
    }

    fn classify(&self, count: usize) -> HealthStatus {
        if count >= self.config.critical_threshold {
            HealthStatus::Critical
        } else if count >= self.config.warn_threshold {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }

    fn prune(recent: &mut VecDeque<FailureRecord>, window: Duration) {
        while recent
            .front()
            .is_some_and(|oldest| oldest.at.elapsed() > window)
        {
            recent.pop_front();
        }
    }
}

impl PersistenceMetrics for PersistenceHealth {
    fn record_persistence_failure(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        error: &RelayError,
    ) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let count = {
            let mut recent = self.recent.lock();
            Self::prune(&mut recent, self.config.window);
            recent.push_back(FailureRecord {
                conversation_id,
                role,
                error_kind: error.kind(),
                at: Instant::now(),
            });
            recent.len()
        };

        match self.classify(count) {
            HealthStatus::Critical => error!(
                %conversation_id, %role, error_kind = error.kind(), recent_failures = count,
                "Persistence failures critical"
            ),
            HealthStatus::Warning => warn!(
                %conversation_id, %role, error_kind = error.kind(), recent_failures = count,
                "Persistence failures elevated"
            ),
            HealthStatus::Healthy => warn!(
                %conversation_id, %role, error_kind = error.kind(), error = %error,
                "Message not persisted"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases_on_drop() {
        let gauge = ActiveRequestGauge::new();
        {
            let _a = gauge.acquire();
            let _b = gauge.acquire();
            assert_eq!(gauge.get(), 2);
        }
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let gauge = ActiveRequestGauge::new();
        let inner = gauge.clone();

        let result = std::panic::catch_unwind(move || {
            let _guard = inner.acquire();
            panic!("turn failed");
        });

        assert!(result.is_err());
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_guard_across_threads() {
        let gauge = ActiveRequestGauge::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gauge = gauge.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = gauge.acquire();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_global_is_shared() {
        let a = ActiveRequestGauge::global();
        let b = ActiveRequestGauge::global();
        assert!(Arc::ptr_eq(&a.active, &b.active));
    }

    fn record(health: &PersistenceHealth, n: usize) {
        let err = RelayError::Internal("disk".to_string());
        for _ in 0..n {
            health.record_persistence_failure(Uuid::new_v4(), MessageRole::Assistant, &err);
        }
    }

    #[test]
    fn test_health_thresholds() {
        let health = PersistenceHealth::default();
        assert_eq!(health.status(), HealthStatus::Healthy);

        record(&health, 4);
        assert_eq!(health.status(), HealthStatus::Healthy);

        record(&health, 1);
        assert_eq!(health.status(), HealthStatus::Warning);

        record(&health, 15);
        assert_eq!(health.status(), HealthStatus::Critical);
        assert_eq!(health.total_failures(), 20);
    }

    #[test]
    fn test_failures_age_out() {
        let health = PersistenceHealth::new(HealthConfig {
            window: Duration::ZERO,
            ..HealthConfig::default()
        });
        record(&health, 10);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(health.recent_failures(), 0);
        assert_eq!(health.status(), HealthStatus::Healthy);
        assert_eq!(health.total_failures(), 10);
    }

    #[test]
    fn test_records_are_tagged() {
        let health = PersistenceHealth::default();
        let id = Uuid::new_v4();
        health.record_persistence_failure(
            id,
            MessageRole::Assistant,
            &RelayError::Upstream("reset".to_string()),
        );

        let records = health.recent_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].conversation_id, id);
        assert_eq!(records[0].role, MessageRole::Assistant);
        assert_eq!(records[0].error_kind, "upstream");
    }
}
