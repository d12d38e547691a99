//! One analysis cycle: pre-screen a batch, stream a model response, run any
//! requested tools, parse and stamp the anomalies.

use super::parser::parse_anomalies;
use super::prompt::{system_prompt, user_prompt};
use super::{AnalysisConfig, Anomaly};
use crate::ingest::prescreen::{pre_screen, PreScreenConfig};
use crate::llm::{CreateMessageParams, LlmProvider, Message, ResponseFormat, StreamEvent, ToolRegistry, ToolResult};
use crate::utils::time::now_ms;
use crate::utils::types::Tick;
use crate::Result;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleState {
    pub cycle_id: String,
    pub session_id: String,
    pub batch_number: u64,
    pub anomalies_detected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleResult {
    pub anomalies: Vec<Anomaly>,
    pub tick_count: usize,
    pub state: CycleState,
    /// Present (possibly empty) only when a tool registry is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<ToolResult>>,
}

pub struct CycleOrchestrator {
    provider: Arc<dyn LlmProvider>,
    config: AnalysisConfig,
    prescreen: PreScreenConfig,
    tools: Option<Arc<ToolRegistry>>,
    anomaly_sink: Option<UnboundedSender<Anomaly>>,
    state: CycleState,
}

impl CycleOrchestrator {
    pub fn new(provider: Arc<dyn LlmProvider>, config: AnalysisConfig, prescreen: PreScreenConfig) -> Self {
        Self {
            provider,
            config,
            prescreen,
            tools: None,
            anomaly_sink: None,
            state: CycleState {
                cycle_id: Uuid::new_v4().to_string(),
                session_id: Uuid::new_v4().to_string(),
                batch_number: 0,
                anomalies_detected: 0,
            },
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.state.session_id = session_id.into();
        self
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Every anomaly is sent here, in parse order, as soon as a run succeeds.
    pub fn with_anomaly_sink(mut self, sink: UnboundedSender<Anomaly>) -> Self {
        self.anomaly_sink = Some(sink);
        self
    }

    pub fn state(&self) -> &CycleState {
        &self.state
    }

    pub fn set_memory_context(&mut self, context: Option<String>) {
        self.config.memory_context = context;
    }

    fn params(&self, ticks: &[Tick]) -> CreateMessageParams {
        let scored = pre_screen(ticks, &self.prescreen);
        let tools = self.tools.as_ref().map(|t| t.definitions()).filter(|d| !d.is_empty());
        CreateMessageParams {
            model: self.config.model.clone(),
            messages: vec![Message::user(user_prompt(
                self.state.batch_number,
                &scored,
                self.config.memory_context.as_deref(),
            ))],
            system: Some(system_prompt(&self.config, tools.is_some())),
            temperature: Some(self.config.temperature),
            max_tokens: self.config.max_tokens,
            tools,
            response_format: Some(ResponseFormat::Json),
        }
    }

    /// Run one cycle. A provider failure fails the run with no anomalies
    /// emitted; `batch_number` still advances.
    pub async fn run(&mut self, ticks: &[Tick]) -> Result<CycleResult> {
        self.state.batch_number += 1;
        let params = self.params(ticks);
        debug!(cycle_id = %self.state.cycle_id, batch = self.state.batch_number, ticks = ticks.len(), "cycle start");

        let mut stream = self.provider.create_message(&params).await?;
        let mut text = String::new();
        let mut tool_results = self.tools.as_ref().map(|_| Vec::new());
        while let Some(event) = stream.next().await {
            match event? {
                | StreamEvent::TextDelta { text: delta } => text.push_str(&delta),
                | StreamEvent::ToolUse { id, name, input } => match (&self.tools, tool_results.as_mut()) {
                    | (Some(registry), Some(results)) => {
                        let result = registry.run(&id, &name, input).await;
                        if let Some(err) = &result.error {
                            warn!(tool = %name, error = %err, "tool call failed");
                        }
                        results.push(result);
                    }
                    | _ => debug!(tool = %name, "ignoring tool_use without a registry"),
                },
                | StreamEvent::Usage(usage) => {
                    debug!(input = usage.input, output = usage.output, "token usage");
                }
                | StreamEvent::Stop { reason } => debug!(%reason, "response complete"),
            }
        }

        let parsed = parse_anomalies(&text)?;
        let timestamp = now_ms();
        let anomalies: Vec<Anomaly> = parsed
            .into_iter()
            .map(|p| Anomaly {
                id: Uuid::new_v4().to_string(),
                session_id: self.state.session_id.clone(),
                timestamp,
                severity: p.severity,
                source: p.source,
                symbol: p.symbol,
                description: p.description,
                metrics: p.metrics,
                pre_screen_score: p.pre_screen_score.unwrap_or(0.0),
            })
            .collect();

        self.state.anomalies_detected += anomalies.len() as u64;
        metrics::counter!("tickscope_anomalies_total", anomalies.len() as u64);
        if let Some(sink) = &self.anomaly_sink {
            for a in &anomalies {
                let _ = sink.send(a.clone());
            }
        }
        if !anomalies.is_empty() {
            info!(cycle_id = %self.state.cycle_id, count = anomalies.len(), "anomalies detected");
        }

        Ok(CycleResult { anomalies, tick_count: ticks.len(), state: self.state.clone(), tool_results })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::builtin_tools::register_builtin_tools;
    use crate::llm::{EventStream, ProviderHealth};
    use crate::Error;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use futures::stream;
    use parking_lot::Mutex;
    use serde_json::json;

    struct CannedProvider {
        events: Vec<StreamEvent>,
        fail: bool,
        seen: Mutex<Vec<CreateMessageParams>>,
    }

    impl CannedProvider {
        fn text(text: &str) -> Self {
            Self::events(vec![StreamEvent::TextDelta { text: text.into() }])
        }

        fn events(events: Vec<StreamEvent>) -> Self {
            Self { events, fail: false, seen: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl LlmProvider for CannedProvider {
        fn id(&self) -> &str {
            "canned"
        }

        async fn create_message(&self, params: &CreateMessageParams) -> Result<EventStream> {
            self.seen.lock().push(params.clone());
            if self.fail {
                return Err(Error::AllProvidersFailed(vec![]));
            }
            Ok(stream::iter(self.events.clone().into_iter().map(Ok)).boxed())
        }

        async fn health_check(&self) -> ProviderHealth {
            ProviderHealth::offline("canned", "n/a")
        }

        async fn list_models(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    fn ticks() -> Vec<Tick> {
        vec![Tick::new("csv", 1_000).with_symbol("AAPL").with_metric("close", 1.0)]
    }

    #[tokio::test]
    async fn empty_array_yields_no_anomalies() {
        let mut orch = CycleOrchestrator::new(
            Arc::new(CannedProvider::text("```json\n[]\n```")),
            AnalysisConfig::default(),
            PreScreenConfig::default(),
        );
        let result = orch.run(&ticks()).await.unwrap();
        assert!(result.anomalies.is_empty());
        assert_eq!(result.tick_count, 1);
        assert_eq!(result.state.batch_number, 1);
        assert_eq!(result.state.anomalies_detected, 0);
        assert!(result.tool_results.is_none());

        orch.run(&ticks()).await.unwrap();
        assert_eq!(orch.state().batch_number, 2);
    }

    #[tokio::test]
    async fn stamps_valid_anomalies_and_feeds_sink_in_order() {
        let text = r#"[
            {"severity":"high","source":"csv","symbol":"AAPL","description":"first","metrics":{"close":1.0}},
            {"severity":"nope","source":"csv","description":"bad","metrics":{}},
            {"severity":"low","source":"csv","description":"second","metrics":{},"preScreenScore":0.4}
        ]"#;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut orch = CycleOrchestrator::new(
            Arc::new(CannedProvider::text(text)),
            AnalysisConfig::default(),
            PreScreenConfig::default(),
        )
        .with_session_id("session-1")
        .with_anomaly_sink(tx);

        let result = orch.run(&ticks()).await.unwrap();
        assert_eq!(result.anomalies.len(), 2);
        assert_eq!(result.state.anomalies_detected, 2);
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.description, "first");
        assert_eq!(first.session_id, "session-1");
        assert_eq!(first.pre_screen_score, 0.0);
        assert_eq!(second.pre_screen_score, 0.4);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn executes_tools_and_collects_results() {
        let provider = Arc::new(CannedProvider::events(vec![
            StreamEvent::ToolUse {
                id: "tu_1".into(),
                name: "rsi".into(),
                input: json!({"values": (0..30).map(|i| i as f64).collect::<Vec<_>>()}),
            },
            StreamEvent::ToolUse { id: "tu_2".into(), name: "does_not_exist".into(), input: json!({}) },
            StreamEvent::TextDelta { text: "[]".into() },
            StreamEvent::Stop { reason: "end_turn".into() },
        ]));
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry);
        let mut orch = CycleOrchestrator::new(provider.clone(), AnalysisConfig::default(), PreScreenConfig::default())
            .with_tools(Arc::new(registry));

        let result = orch.run(&ticks()).await.unwrap();
        let tools = result.tool_results.unwrap();
        assert_eq!(tools.len(), 2);
        assert!(tools[0].output.is_some());
        assert!(tools[1].error.as_ref().unwrap().contains("does_not_exist"));

        let sent = provider.seen.lock()[0].clone();
        assert_eq!(sent.tools.unwrap().len(), 3);
        assert_eq!(sent.response_format, Some(ResponseFormat::Json));
    }

    #[tokio::test]
    async fn provider_failure_propagates_without_side_effects() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let provider = CannedProvider { fail: true, ..CannedProvider::text("[]") };
        let mut orch =
            CycleOrchestrator::new(Arc::new(provider), AnalysisConfig::default(), PreScreenConfig::default())
                .with_anomaly_sink(tx);
        assert_matches!(orch.run(&ticks()).await, Err(Error::AllProvidersFailed(_)));
        assert_eq!(orch.state().anomalies_detected, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unparseable_response_fails_the_run() {
        let mut orch = CycleOrchestrator::new(
            Arc::new(CannedProvider::text("I am not sure.")),
            AnalysisConfig::default(),
            PreScreenConfig::default(),
        );
        assert_matches!(orch.run(&ticks()).await, Err(Error::ResponseParse(_)));
    }
}
