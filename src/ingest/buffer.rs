//! Batching buffer between irregular tick arrival and the analysis cadence.
//!
//! A single flush timer fires every `flush_interval_ms` for the lifetime of
//! the buffer and flushes unconditionally; an empty batch is still delivered.
//! `push_urgent` with a score at or above `urgent_threshold` flushes at once.
//! Consumers wait on [`BatchBuffer::next_batch`]; each flush serves the
//! oldest outstanding request and nothing else.

use crate::utils::types::Tick;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub flush_interval_ms: u64,
    pub urgent_threshold: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { flush_interval_ms: 5_000, urgent_threshold: 0.6 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Interval,
    Urgent,
}

#[derive(Debug, Clone)]
pub enum BufferEvent {
    /// A flush happened; carries the delivered batch.
    Flush { batch: Arc<Vec<Tick>>, reason: FlushReason },
    /// An urgent push crossed the threshold.
    Urgent { score: f64 },
}

type Waiter = oneshot::Sender<Result<Vec<Tick>>>;

#[derive(Default)]
struct BufferState {
    ticks: Vec<Tick>,
    waiters: VecDeque<Waiter>,
    destroyed: bool,
}

struct Inner {
    config: BufferConfig,
    state: Mutex<BufferState>,
    events: broadcast::Sender<BufferEvent>,
    cancel: CancellationToken,
}

/// Cloneable handle; all clones share one accumulator and one timer.
#[derive(Clone)]
pub struct BatchBuffer {
    inner: Arc<Inner>,
}

impl BatchBuffer {
    /// Create the buffer and start its flush timer. Must be called from
    /// within a tokio runtime.
    pub fn new(config: BufferConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let inner = Arc::new(Inner {
            config,
            state: Mutex::new(BufferState::default()),
            events,
            cancel: CancellationToken::new(),
        });
        tokio::spawn(run_flush_timer(Arc::downgrade(&inner), inner.cancel.clone()));
        Self { inner }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BufferEvent> {
        self.inner.events.subscribe()
    }

    /// Ticks accumulated since the last flush.
    pub fn size(&self) -> usize {
        self.inner.state.lock().ticks.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    pub fn push(&self, tick: Tick) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return Err(Error::BufferDestroyed);
        }
        state.ticks.push(tick);
        Ok(())
    }

    /// Append a tick; flush immediately when `score` meets the urgency
    /// threshold. Returns whether a flush was triggered.
    pub fn push_urgent(&self, tick: Tick, score: f64) -> Result<bool> {
        self.push(tick)?;
        if score < self.inner.config.urgent_threshold {
            return Ok(false);
        }
        let _ = self.inner.events.send(BufferEvent::Urgent { score });
        metrics::counter!("tickscope_urgent_flushes_total", 1);
        self.inner.flush(FlushReason::Urgent);
        Ok(true)
    }

    /// Request the next batch. The request is queued when this is called,
    /// not when the future is first polled, so FIFO order follows call order.
    pub fn next_batch(&self) -> impl Future<Output = Result<Vec<Tick>>> + Send + 'static {
        let registered = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                Err(Error::BufferDestroyed)
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Ok(rx)
            }
        };
        async move {
            match registered {
                | Ok(rx) => rx.await.unwrap_or(Err(Error::BufferDestroyed)),
                | Err(e) => Err(e),
            }
        }
    }

    /// Force a flush now, as if the timer had fired.
    pub fn flush(&self) {
        self.inner.flush(FlushReason::Interval);
    }

    /// Terminal. Cancels the timer, fails outstanding requests and every
    /// later push or request. Idempotent.
    pub fn destroy(&self) {
        let waiters = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.ticks.clear();
            std::mem::take(&mut state.waiters)
        };
        self.inner.cancel.cancel();
        for w in waiters {
            let _ = w.send(Err(Error::BufferDestroyed));
        }
        info!("batch buffer destroyed");
    }
}

impl Inner {
    fn flush(&self, reason: FlushReason) {
        let (batch, served) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            let batch = Arc::new(std::mem::take(&mut state.ticks));
            let mut payload = (*batch).clone();
            let mut served = false;
            // Requests whose caller went away are skipped, not served.
            while let Some(waiter) = state.waiters.pop_front() {
                match waiter.send(Ok(payload)) {
                    | Ok(()) => {
                        served = true;
                        break;
                    }
                    | Err(returned) => payload = returned.unwrap_or_default(),
                }
            }
            (batch, served)
        };
        metrics::counter!("tickscope_batches_flushed_total", 1);
        debug!(?reason, size = batch.len(), served, "buffer flushed");
        let _ = self.events.send(BufferEvent::Flush { batch, reason });
    }
}

async fn run_flush_timer(inner: Weak<Inner>, cancel: CancellationToken) {
    let Some(period) = inner.upgrade().map(|i| i.config.flush_interval_ms.max(1)) else { return };
    let period = Duration::from_millis(period);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match inner.upgrade() {
                    | Some(inner) => inner.flush(FlushReason::Interval),
                    | None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn tick(n: u64) -> Tick {
        Tick::new("src", n).with_metric("close", n as f64)
    }

    fn buffer(ms: u64) -> BatchBuffer {
        BatchBuffer::new(BufferConfig { flush_interval_ms: ms, urgent_threshold: 0.6 })
    }

    #[tokio::test(start_paused = true)]
    async fn interval_flush_delivers_pushed_ticks_in_order() {
        let buf = buffer(1_000);
        for n in 1..=3 {
            buf.push(tick(n)).unwrap();
        }
        assert_eq!(buf.size(), 3);
        let batch = buf.next_batch().await.unwrap();
        assert_eq!(batch.iter().map(|t| t.timestamp).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(buf.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_interval_flush_is_delivered() {
        let buf = buffer(500);
        let batch = buf.next_batch().await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn urgent_push_above_threshold_flushes_immediately() {
        let buf = buffer(60_000);
        let pending = buf.next_batch();
        assert!(buf.push_urgent(tick(1), 0.9).unwrap());
        let batch = tokio::time::timeout(Duration::from_millis(1), pending)
            .await
            .expect("urgent push should resolve the request without waiting")
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn urgent_push_below_threshold_waits_for_interval() {
        let buf = buffer(60_000);
        let pending = buf.next_batch();
        assert!(!buf.push_urgent(tick(1), 0.3).unwrap());
        assert!(tokio::time::timeout(Duration::from_millis(10), pending).await.is_err());
        assert_eq!(buf.size(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_requests_are_served_one_per_flush_in_fifo_order() {
        let buf = buffer(60_000);
        let first = buf.next_batch();
        let second = buf.next_batch();
        buf.push(tick(1)).unwrap();
        buf.flush();
        buf.push(tick(2)).unwrap();
        buf.flush();
        assert_eq!(first.await.unwrap()[0].timestamp, 1);
        assert_eq!(second.await.unwrap()[0].timestamp, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_request_does_not_swallow_a_batch() {
        let buf = buffer(60_000);
        drop(buf.next_batch());
        let live = buf.next_batch();
        buf.push(tick(9)).unwrap();
        buf.flush();
        assert_eq!(live.await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_event_carries_batch() {
        let buf = buffer(60_000);
        let mut events = buf.subscribe();
        buf.push(tick(1)).unwrap();
        buf.push_urgent(tick(2), 1.0).unwrap();
        assert_matches!(events.recv().await.unwrap(), BufferEvent::Urgent { score } if score == 1.0);
        match events.recv().await.unwrap() {
            | BufferEvent::Flush { batch, reason } => {
                assert_eq!(batch.len(), 2);
                assert_eq!(reason, FlushReason::Urgent);
            }
            | other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_fails_pending_and_future_operations() {
        let buf = buffer(60_000);
        let pending = buf.next_batch();
        buf.destroy();
        buf.destroy();
        assert_matches!(pending.await, Err(Error::BufferDestroyed));
        assert_matches!(buf.push(tick(1)), Err(Error::BufferDestroyed));
        assert_matches!(buf.push_urgent(tick(1), 1.0), Err(Error::BufferDestroyed));
        assert_matches!(buf.next_batch().await, Err(Error::BufferDestroyed));
        assert!(buf.is_destroyed());
    }
}
