//! Polling scheduler: one independent timer per source with exponential
//! backoff on failure.

use super::Source;
use crate::utils::types::Tick;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Used when a source has no `poll_interval_ms` of its own
    pub default_poll_interval_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { default_poll_interval_ms: 60_000, backoff_multiplier: 2.0, max_backoff_ms: 300_000 }
    }
}

impl SchedulerConfig {
    /// Delay before the next poll after `failures` consecutive failures:
    /// `base * multiplier^failures`, capped at `max_backoff_ms`.
    pub fn backoff_delay(&self, base_ms: u64, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::from_millis(base_ms);
        }
        let exp = failures.min(i32::MAX as u32) as i32;
        let raw = base_ms as f64 * self.backoff_multiplier.powi(exp);
        let capped = if raw.is_finite() { raw.min(self.max_backoff_ms as f64) } else { self.max_backoff_ms as f64 };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A fetch returned one or more ticks
    Ticks { source_id: String, ticks: Vec<Tick> },
    /// A fetch failed; `consecutive_failures` is the backoff counter after it
    Error { source_id: String, error: String, consecutive_failures: u32 },
}

struct Entry {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Drives sources on independent timers. Backoff state is per source.
pub struct PollScheduler {
    config: SchedulerConfig,
    events: UnboundedSender<SchedulerEvent>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl PollScheduler {
    pub fn new(config: SchedulerConfig) -> (Self, UnboundedReceiver<SchedulerEvent>) {
        let (events, rx) = unbounded_channel();
        (Self { config, events, entries: Mutex::new(HashMap::new()) }, rx)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Start polling `source`. Scheduling an id that is already scheduled
    /// replaces the previous timer.
    pub fn schedule(&self, source: Arc<dyn Source>) {
        let id = source.id().to_string();
        let base_ms = source
            .config()
            .poll_interval_ms
            .unwrap_or(self.config.default_poll_interval_ms)
            .max(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            source,
            self.config,
            base_ms,
            self.events.clone(),
            cancel.clone(),
        ));
        if let Some(old) = self.entries.lock().insert(id.clone(), Entry { cancel, handle }) {
            old.cancel.cancel();
        }
        info!(source_id = %id, interval_ms = base_ms, "source scheduled");
    }

    /// Cancel one source's timer. Returns whether it was scheduled.
    pub fn unschedule(&self, id: &str) -> bool {
        match self.entries.lock().remove(id) {
            | Some(entry) => {
                entry.cancel.cancel();
                debug!(source_id = id, "source unscheduled");
                true
            }
            | None => false,
        }
    }

    pub fn stop_all(&self) {
        let entries: Vec<_> = self.entries.lock().drain().collect();
        for (_, entry) in entries {
            entry.cancel.cancel();
        }
    }

    pub fn is_scheduled(&self, id: &str) -> bool {
        self.entries.lock().get(id).map_or(false, |e| !e.handle.is_finished())
    }

    pub fn scheduled_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.entries.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

async fn poll_loop(
    source: Arc<dyn Source>,
    config: SchedulerConfig,
    base_ms: u64,
    events: UnboundedSender<SchedulerEvent>,
    cancel: CancellationToken,
) {
    let source_id = source.id().to_string();
    let mut failures: u32 = 0;
    let mut delay = Duration::from_millis(base_ms);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        let result = source.fetch().await;
        // Unscheduled while the fetch was in flight: drop the result quietly.
        if cancel.is_cancelled() {
            break;
        }
        match result {
            | Ok(ticks) => {
                failures = 0;
                if !ticks.is_empty() {
                    debug!(source_id = %source_id, count = ticks.len(), "fetched ticks");
                    let _ = events.send(SchedulerEvent::Ticks { source_id: source_id.clone(), ticks });
                }
            }
            | Err(e) => {
                failures = failures.saturating_add(1);
                metrics::counter!("tickscope_source_fetch_errors_total", 1);
                warn!(source_id = %source_id, failures, error = %e, "fetch failed");
                let _ = events.send(SchedulerEvent::Error {
                    source_id: source_id.clone(),
                    error: e.to_string(),
                    consecutive_failures: failures,
                });
            }
        }
        delay = config.backoff_delay(base_ms, failures);
    }
    debug!(source_id = %source_id, "poll loop exited");
}
