//! Monitor loop: waits on buffer flushes and runs one analysis cycle per
//! non-empty batch until stopped.

use crate::analysis::{CycleOrchestrator, CycleResult};
use crate::events::{AgentActivity, AgentActivityType, AgentState, AgentStatus, EventBus};
use crate::ingest::buffer::BatchBuffer;
use crate::utils::types::Tick;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::sync::Arc;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Default)]
struct StatusCell {
    status: AgentStatus,
    started_at: Option<Instant>,
    /// Bumped on every start so a finishing old loop cannot clobber a newer run.
    generation: u64,
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct LoopCtx {
    buffer: BatchBuffer,
    orchestrator: Arc<tokio::sync::Mutex<CycleOrchestrator>>,
    bus: EventBus,
    status: Arc<RwLock<StatusCell>>,
}

pub struct MonitorLoop {
    ctx: LoopCtx,
    session_id: String,
    cycle_id: String,
    run: Mutex<Option<RunHandle>>,
}

impl MonitorLoop {
    pub fn new(buffer: BatchBuffer, orchestrator: CycleOrchestrator, bus: EventBus) -> Self {
        let session_id = orchestrator.state().session_id.clone();
        let cycle_id = orchestrator.state().cycle_id.clone();
        Self {
            ctx: LoopCtx {
                buffer,
                orchestrator: Arc::new(tokio::sync::Mutex::new(orchestrator)),
                bus,
                status: Arc::new(RwLock::new(StatusCell::default())),
            },
            session_id,
            cycle_id,
            run: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.ctx.status.read().status.state == AgentState::Running
    }

    /// Snapshot of the counters. `total_cycles` counts non-empty batches only.
    pub fn status(&self) -> AgentStatus {
        let cell = self.ctx.status.read();
        let mut status = cell.status.clone();
        status.uptime = match (status.state, cell.started_at) {
            | (AgentState::Running, Some(t)) => t.elapsed().as_millis() as u64,
            | _ => 0,
        };
        status
    }

    pub fn start(&self) -> Result<()> {
        let mut run = self.run.lock();
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }
        let generation = {
            let mut cell = self.ctx.status.write();
            cell.generation += 1;
            cell.started_at = Some(Instant::now());
            cell.status.state = AgentState::Running;
            cell.status.current_session_id = Some(self.session_id.clone());
            cell.status.current_cycle_id = Some(self.cycle_id.clone());
            cell.generation
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(self.ctx.clone(), cancel.clone(), generation));
        *run = Some(RunHandle { cancel, task });
        info!(session_id = %self.session_id, "monitor started");
        Ok(())
    }

    /// Stop requesting batches. A cycle already in flight runs to completion
    /// in the background.
    pub fn stop(&self) {
        if let Some(handle) = self.run.lock().take() {
            handle.cancel.cancel();
        }
        let mut cell = self.ctx.status.write();
        if cell.status.state == AgentState::Running {
            cell.status.state = AgentState::Idle;
            cell.started_at = None;
            info!(session_id = %self.session_id, "monitor stopped");
        }
    }

    /// Stop and wait for the loop, including any in-flight cycle, to finish.
    pub async fn shutdown(&self) {
        let handle = self.run.lock().take();
        self.stop();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.task.await;
        }
    }
}

impl Drop for MonitorLoop {
    fn drop(&mut self) {
        if let Some(handle) = self.run.get_mut().take() {
            handle.cancel.cancel();
        }
    }
}

/// Runs one cycle per non-empty batch. Empty interval flushes are skipped and
/// advance neither `batch_number` nor `total_cycles`.
async fn run_loop(ctx: LoopCtx, cancel: CancellationToken, generation: u64) {
    loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            batch = ctx.buffer.next_batch() => batch,
        };
        match batch {
            | Ok(ticks) if ticks.is_empty() => continue,
            | Ok(ticks) => run_cycle(&ctx, ticks).await,
            | Err(e) => {
                warn!(error = %e, "monitor loop ending: buffer unavailable");
                let mut cell = ctx.status.write();
                if cell.generation == generation {
                    cell.status.state = AgentState::Idle;
                    cell.status.last_error = Some(e.to_string());
                    cell.started_at = None;
                }
                break;
            }
        }
    }
}

async fn run_cycle(ctx: &LoopCtx, ticks: Vec<Tick>) {
    let mut orchestrator = ctx.orchestrator.lock().await;
    let batch_number = orchestrator.state().batch_number + 1;
    ctx.bus.activity(
        AgentActivity::new(AgentActivityType::CycleStart, format!("cycle {} started", batch_number))
            .with_data("tickCount", json!(ticks.len())),
    );

    let started = Instant::now();
    let result = orchestrator.run(&ticks).await;
    drop(orchestrator);
    let elapsed_ms = started.elapsed().as_millis() as u64;
    metrics::counter!("tickscope_cycles_total", 1);
    metrics::histogram!("tickscope_cycle_ms", elapsed_ms as f64);

    match result {
        | Ok(CycleResult { anomalies, .. }) => {
            {
                let mut cell = ctx.status.write();
                cell.status.total_cycles += 1;
                cell.status.total_anomalies += anomalies.len() as u64;
            }
            let count = anomalies.len();
            for anomaly in anomalies {
                ctx.bus.activity(
                    AgentActivity::new(AgentActivityType::AnomalyDetected, anomaly.description.clone())
                        .with_data("anomalyId", json!(anomaly.id))
                        .with_data("severity", json!(anomaly.severity)),
                );
                ctx.bus.anomaly(anomaly);
            }
            ctx.bus.activity(
                AgentActivity::new(AgentActivityType::CycleEnd, format!("cycle {} complete", batch_number))
                    .with_data("anomalies", json!(count))
                    .with_data("durationMs", json!(elapsed_ms)),
            );
        }
        | Err(e) => {
            error!(batch = batch_number, error = %e, "analysis cycle failed");
            metrics::counter!("tickscope_cycle_errors_total", 1);
            {
                let mut cell = ctx.status.write();
                cell.status.total_cycles += 1;
                cell.status.last_error = Some(e.to_string());
            }
            ctx.bus.activity(AgentActivity::new(AgentActivityType::Error, e.to_string()));
            ctx.bus.activity(
                AgentActivity::new(AgentActivityType::CycleEnd, format!("cycle {} failed", batch_number))
                    .with_data("anomalies", json!(0))
                    .with_data("durationMs", json!(elapsed_ms)),
            );
        }
    }
}
