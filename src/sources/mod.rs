//! Market-data sources: the `Source` contract, the registry holding named
//! sources, the polling scheduler driving them, and the concrete variants.

pub mod alpaca_rest;
pub mod alpaca_stream;
pub mod factory;
pub mod file;
pub mod registry;
pub mod scheduler;

use crate::utils::time::now_ms;
use crate::utils::types::{SourceConfig, SourceHealth, SourceHealthStatus, Tick};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

pub use factory::create_source;
pub use registry::SourceRegistry;
pub use scheduler::{PollScheduler, SchedulerConfig, SchedulerEvent};

/// Failures at or above this count report a source as offline.
pub const OFFLINE_FAILURE_COUNT: u32 = 3;

/// Trait implemented by every market-data source.
///
/// `start` and `stop` must be idempotent. `fetch` returns whatever the
/// source has accumulated or can read since the previous call; it never
/// returns the same tick twice.
#[async_trait]
pub trait Source: Send + Sync {
    fn config(&self) -> &SourceConfig;

    fn id(&self) -> &str {
        &self.config().id
    }

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn fetch(&self) -> Result<Vec<Tick>>;

    async fn health_check(&self) -> Result<SourceHealth>;
}

#[derive(Debug, Default, Clone)]
struct HealthCounters {
    last_success: u64,
    last_failure: Option<u64>,
    fail_count: u32,
    latency_ms: u64,
    message: Option<String>,
}

/// Success/failure bookkeeping shared by the polling sources.
#[derive(Debug, Default)]
pub struct HealthTracker {
    counters: Mutex<HealthCounters>,
}

impl HealthTracker {
    pub fn record_success(&self, latency_ms: u64) {
        let mut c = self.counters.lock();
        c.last_success = now_ms();
        c.fail_count = 0;
        c.latency_ms = latency_ms;
        c.message = None;
    }

    pub fn record_failure(&self, message: impl Into<String>) {
        let mut c = self.counters.lock();
        c.last_failure = Some(now_ms());
        c.fail_count = c.fail_count.saturating_add(1);
        c.message = Some(message.into());
    }

    /// Healthy with no failures, offline at [`OFFLINE_FAILURE_COUNT`] or more,
    /// degraded in between. A source that is not running is offline.
    pub fn snapshot(&self, source_id: &str, running: bool) -> SourceHealth {
        let c = self.counters.lock().clone();
        let status = if !running || c.fail_count >= OFFLINE_FAILURE_COUNT {
            SourceHealthStatus::Offline
        } else if c.fail_count == 0 {
            SourceHealthStatus::Healthy
        } else {
            SourceHealthStatus::Degraded
        };
        SourceHealth {
            source_id: source_id.to_string(),
            status,
            last_success: c.last_success,
            last_failure: c.last_failure,
            fail_count: c.fail_count,
            latency_ms: c.latency_ms,
            message: if running { c.message } else { Some("source not started".into()) },
        }
    }
}
