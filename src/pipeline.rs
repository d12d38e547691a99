//! Composition root wiring sources, the scheduler, the batch buffer, the
//! provider chain and the monitor loop into one runnable pipeline.

use crate::analysis::CycleOrchestrator;
use crate::config::{Config, ProviderConfig, ProviderKind};
use crate::events::{AgentStatus, EventBus};
use crate::ingest::buffer::BatchBuffer;
use crate::ingest::normalize::normalize_all;
use crate::ingest::prescreen::{pre_screen, PreScreenConfig};
use crate::llm::anthropic::AnthropicProvider;
use crate::llm::builtin_tools::register_builtin_tools;
use crate::llm::openrouter::OpenRouterProvider;
use crate::llm::{FallbackProvider, LlmProvider, ToolRegistry};
use crate::monitor::MonitorLoop;
use crate::sources::{create_source, PollScheduler, SchedulerEvent, Source, SourceRegistry};
use crate::utils::types::{SourceHealth, SourceHealthStatus, SourceKind, Tick};
use crate::{metrics as m, Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drain interval for streaming sources that do not set one.
pub const STREAM_DRAIN_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineHealth {
    pub sources: Vec<SourceHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor: Option<AgentStatus>,
    pub buffered_ticks: usize,
}

struct IngestHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct IngestCtx {
    buffer: BatchBuffer,
    bus: EventBus,
    registry: Arc<SourceRegistry>,
    prescreen: PreScreenConfig,
}

pub struct Pipeline {
    registry: Arc<SourceRegistry>,
    scheduler: PollScheduler,
    scheduler_rx: Mutex<Option<UnboundedReceiver<SchedulerEvent>>>,
    buffer: BatchBuffer,
    bus: EventBus,
    prescreen: PreScreenConfig,
    monitor: Option<MonitorLoop>,
    ingest: Mutex<Option<IngestHandle>>,
    running: AtomicBool,
}

impl Pipeline {
    /// Build every component named by `config`. Must be called inside a
    /// tokio runtime; API keys are resolved here so a missing key fails fast.
    pub fn from_config(config: &Config) -> Result<Self> {
        let provider: Option<Arc<dyn LlmProvider>> = if config.monitor.enabled {
            Some(Arc::new(build_provider_chain(&config.providers)?))
        } else {
            None
        };
        let pipeline = Self::new(config, provider);
        for source_cfg in &config.sources {
            let mut source_cfg = source_cfg.clone();
            if source_cfg.kind == SourceKind::Streaming && source_cfg.poll_interval_ms.is_none() {
                source_cfg.poll_interval_ms = Some(STREAM_DRAIN_INTERVAL_MS);
            }
            pipeline.register_source(create_source(source_cfg)?)?;
        }
        Ok(pipeline)
    }

    /// Assemble a pipeline with no sources around an already-built provider.
    /// Without a provider no monitor loop is created and the pipeline only
    /// ingests.
    pub fn new(config: &Config, provider: Option<Arc<dyn LlmProvider>>) -> Self {
        let (scheduler, scheduler_rx) = PollScheduler::new(config.scheduler);
        let buffer = BatchBuffer::new(config.buffer);
        let bus = EventBus::default();

        let monitor = provider.map(|provider| {
            let mut orchestrator = CycleOrchestrator::new(provider, config.analysis.clone(), config.prescreen);
            if config.analysis.enable_tools {
                let mut tools = ToolRegistry::new();
                register_builtin_tools(&mut tools);
                orchestrator = orchestrator.with_tools(Arc::new(tools));
            }
            MonitorLoop::new(buffer.clone(), orchestrator, bus.clone())
        });

        Self {
            registry: Arc::new(SourceRegistry::new()),
            scheduler,
            scheduler_rx: Mutex::new(Some(scheduler_rx)),
            buffer,
            bus,
            prescreen: config.prescreen,
            monitor,
            ingest: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn register_source(&self, source: Arc<dyn Source>) -> Result<()> {
        self.registry.register(source)
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn buffer(&self) -> &BatchBuffer {
        &self.buffer
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn monitor(&self) -> Option<&MonitorLoop> {
        self.monitor.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start sources, schedule the enabled ones, begin ingesting and start
    /// the monitor. A source that fails to start is reported on the bus and
    /// still scheduled, so it recovers once its backend comes back.
    pub async fn start(&self) -> Result<()> {
        if self.buffer.is_destroyed() {
            return Err(Error::BufferDestroyed);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        let Some(rx) = self.scheduler_rx.lock().take() else {
            self.running.store(false, Ordering::SeqCst);
            return Err(Error::AlreadyRunning);
        };

        for (source_id, e) in self.registry.start_all().await {
            warn!(source_id = %source_id, error = %e, "source failed to start");
            self.bus.source_error(source_id, e.to_string());
        }

        let enabled = self.registry.enabled();
        for source in &enabled {
            self.scheduler.schedule(source.clone());
        }

        let ctx = IngestCtx {
            buffer: self.buffer.clone(),
            bus: self.bus.clone(),
            registry: self.registry.clone(),
            prescreen: self.prescreen,
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(ingest_loop(ctx, rx, cancel.clone()));
        *self.ingest.lock() = Some(IngestHandle { cancel, task });

        if let Some(monitor) = &self.monitor {
            monitor.start()?;
        }
        info!(sources = enabled.len(), monitor = self.monitor.is_some(), "pipeline started");
        Ok(())
    }

    /// Stop everything `start` began and destroy the buffer. The pipeline
    /// cannot be started again afterwards.
    pub async fn stop(&self) {
        self.scheduler.stop_all();
        let ingest = self.ingest.lock().take();
        if let Some(handle) = ingest {
            handle.cancel.cancel();
            let _ = handle.task.await;
        }
        if let Some(monitor) = &self.monitor {
            monitor.shutdown().await;
        }
        self.registry.stop_all().await;
        self.buffer.destroy();
        if self.running.swap(false, Ordering::SeqCst) {
            info!("pipeline stopped");
        }
    }

    pub async fn health(&self) -> PipelineHealth {
        PipelineHealth {
            sources: self.registry.health_check_all().await,
            monitor: self.monitor.as_ref().map(MonitorLoop::status),
            buffered_ticks: self.buffer.size(),
        }
    }
}

/// Build the fallback chain in configured order, resolving each API key.
pub fn build_provider_chain(providers: &[ProviderConfig]) -> Result<FallbackProvider> {
    let mut chain = FallbackProvider::default();
    for cfg in providers {
        let key = cfg.resolve_api_key()?;
        let provider: Arc<dyn LlmProvider> = match (cfg.kind, cfg.base_url.as_deref()) {
            | (ProviderKind::Anthropic, Some(url)) => Arc::new(AnthropicProvider::with_base_url(&cfg.id, key, url)?),
            | (ProviderKind::Anthropic, None) => Arc::new(AnthropicProvider::new(&cfg.id, key)?),
            | (ProviderKind::Openrouter, Some(url)) => Arc::new(OpenRouterProvider::with_base_url(&cfg.id, key, url)?),
            | (ProviderKind::Openrouter, None) => Arc::new(OpenRouterProvider::new(&cfg.id, key)?),
        };
        chain.push(provider, cfg.timeout_secs.map(Duration::from_secs));
    }
    if chain.is_empty() {
        return Err(Error::ConfigError("no providers configured".into()));
    }
    Ok(chain)
}

async fn ingest_loop(ctx: IngestCtx, mut rx: UnboundedReceiver<SchedulerEvent>, cancel: CancellationToken) {
    let mut last_status: HashMap<String, SourceHealthStatus> = HashMap::new();
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                | Some(event) => event,
                | None => break,
            },
        };
        let source_id = match event {
            | SchedulerEvent::Ticks { source_id, ticks } => {
                if !ingest_ticks(&ctx, ticks) {
                    break;
                }
                source_id
            }
            | SchedulerEvent::Error { source_id, error, consecutive_failures } => {
                debug!(source_id = %source_id, consecutive_failures, "fetch failed");
                ctx.bus.source_error(source_id.clone(), error);
                source_id
            }
        };
        report_health_change(&ctx, &source_id, &mut last_status).await;
    }
    debug!("ingest loop ended");
}

/// Normalize and score one fetch, then buffer it. Scores at or above the
/// buffer's urgent threshold flush immediately. Returns false once the
/// buffer is gone.
fn ingest_ticks(ctx: &IngestCtx, ticks: Vec<Tick>) -> bool {
    let ticks = normalize_all(ticks);
    if ticks.is_empty() {
        return true;
    }
    let count = ticks.len() as u64;
    for scored in pre_screen(&ticks, &ctx.prescreen) {
        let tick = scored.tick;
        if let Err(e) = ctx.buffer.push_urgent(tick.clone(), scored.score) {
            warn!(error = %e, "dropping ticks: buffer unavailable");
            return false;
        }
        ctx.bus.tick(tick);
    }
    metrics::counter!(m::TICKS_INGESTED, count);
    true
}

async fn report_health_change(
    ctx: &IngestCtx,
    source_id: &str,
    last_status: &mut HashMap<String, SourceHealthStatus>,
) {
    let Ok(source) = ctx.registry.get(source_id) else { return };
    let health = match source.health_check().await {
        | Ok(h) => h,
        | Err(e) => SourceHealth::offline(source_id, e.to_string()),
    };
    if last_status.insert(source_id.to_string(), health.status) != Some(health.status) {
        ctx.bus.source_health(health);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::events::PipelineEvent;
    use crate::utils::types::SourceConfig;
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    struct OneShotSource {
        config: SourceConfig,
        fetched: AtomicBool,
    }

    #[async_trait]
    impl Source for OneShotSource {
        fn config(&self) -> &SourceConfig {
            &self.config
        }
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn fetch(&self) -> Result<Vec<Tick>> {
            if self.fetched.swap(true, Ordering::SeqCst) {
                return Ok(Vec::new());
            }
            Ok(vec![Tick::new(self.config.id.clone(), 1_000).with_symbol(" msft ").with_metric("close", 410.0)])
        }
        async fn health_check(&self) -> Result<SourceHealth> {
            Ok(SourceHealth {
                source_id: self.config.id.clone(),
                status: SourceHealthStatus::Healthy,
                last_success: 0,
                last_failure: None,
                fail_count: 0,
                latency_ms: 0,
                message: None,
            })
        }
    }

    fn ingest_only() -> Config {
        Config { monitor: MonitorConfig { enabled: false }, ..Config::default() }
    }

    #[test]
    fn empty_provider_chain_is_rejected() {
        assert_matches!(build_provider_chain(&[]).map(|_| ()), Err(Error::ConfigError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn ingests_normalized_ticks_and_publishes_them() {
        let pipeline = Pipeline::new(&ingest_only(), None);
        let cfg = SourceConfig::new("fake", SourceKind::Polling, "fake").with_poll_interval_ms(1_000);
        pipeline
            .register_source(Arc::new(OneShotSource { config: cfg, fetched: AtomicBool::new(false) }))
            .unwrap();
        let mut events = pipeline.bus().subscribe();

        pipeline.start().await.unwrap();
        assert_matches!(pipeline.start().await, Err(Error::AlreadyRunning));
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert_eq!(pipeline.buffer().size(), 1);
        let mut saw_tick = false;
        while let Ok(ev) = events.try_recv() {
            if let PipelineEvent::Tick(t) = ev {
                assert_eq!(t.symbol.as_deref(), Some("MSFT"));
                saw_tick = true;
            }
        }
        assert!(saw_tick);
        let health = pipeline.health().await;
        assert_eq!(health.sources.len(), 1);
        assert!(health.monitor.is_none());

        pipeline.stop().await;
        assert!(!pipeline.is_running());
        assert_matches!(pipeline.start().await, Err(Error::BufferDestroyed));
    }
}
