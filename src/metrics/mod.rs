use once_cell::sync::OnceCell;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::utils::error::{Error, Result};

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

pub const TICKS_INGESTED: &str = "tickscope_ticks_ingested_total";
pub const BATCHES_FLUSHED: &str = "tickscope_batches_flushed_total";
pub const URGENT_FLUSHES: &str = "tickscope_urgent_flushes_total";
pub const SOURCE_FETCH_ERRORS: &str = "tickscope_source_fetch_errors_total";
pub const CYCLES: &str = "tickscope_cycles_total";
pub const CYCLE_ERRORS: &str = "tickscope_cycle_errors_total";
pub const ANOMALIES: &str = "tickscope_anomalies_total";
pub const PROVIDER_FAILURES: &str = "tickscope_provider_failures_total";
pub const CYCLE_MS: &str = "tickscope_cycle_ms";

/// Initialise the global Prometheus recorder.
///
/// Call once at programme start, before any metrics are emitted. Calling it
/// again after a success is a no-op.
pub fn init() -> Result<()> {
    if PROM_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Other(format!("failed to install metrics recorder: {}", e)))?;
    let _ = PROM_HANDLE.set(handle);
    describe();
    Ok(())
}

fn describe() {
    metrics::describe_counter!(TICKS_INGESTED, "Ticks accepted into the batch buffer");
    metrics::describe_counter!(BATCHES_FLUSHED, "Buffer flushes, timed and urgent");
    metrics::describe_counter!(URGENT_FLUSHES, "Flushes triggered by an urgent tick");
    metrics::describe_counter!(SOURCE_FETCH_ERRORS, "Failed source fetches");
    metrics::describe_counter!(CYCLES, "Analysis cycles run");
    metrics::describe_counter!(CYCLE_ERRORS, "Analysis cycles that failed");
    metrics::describe_counter!(ANOMALIES, "Anomalies emitted");
    metrics::describe_counter!(PROVIDER_FAILURES, "Provider attempts that failed inside the fallback chain");
    metrics::describe_histogram!(CYCLE_MS, metrics::Unit::Milliseconds, "Analysis cycle duration");
}

/// The global handle, if [`init`] has run.
pub fn handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Prometheus exposition text; empty before [`init`].
pub fn render() -> String {
    handle().map(|h| h.render()).unwrap_or_default()
}
