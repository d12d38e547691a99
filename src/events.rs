//! Typed pipeline event bus consumed by UI and trading collaborators.

use crate::analysis::Anomaly;
use crate::utils::time::now_ms;
use crate::utils::types::{SourceHealth, Tick};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Wire names of the events, one per [`PipelineEvent`] variant.
pub mod event_names {
    pub const DATA_TICK: &str = "data:tick";
    pub const ANOMALY_DETECTED: &str = "anomaly:detected";
    pub const AGENT_ACTIVITY: &str = "agent:activity";
    pub const SOURCE_HEALTH_CHANGE: &str = "source:health-change";
    pub const SOURCE_ERROR: &str = "source:error";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Running,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub state: AgentState,
    pub current_session_id: Option<String>,
    pub current_cycle_id: Option<String>,
    pub total_cycles: u64,
    pub total_anomalies: u64,
    /// Milliseconds since the monitor was started; 0 while idle.
    pub uptime: u64,
    pub last_error: Option<String>,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self {
            state: AgentState::Idle,
            current_session_id: None,
            current_cycle_id: None,
            total_cycles: 0,
            total_anomalies: 0,
            uptime: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentActivityType {
    CycleStart,
    CycleEnd,
    AnomalyDetected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentActivity {
    #[serde(rename = "type")]
    pub activity_type: AgentActivityType,
    pub message: String,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<HashMap<String, serde_json::Value>>,
}

impl AgentActivity {
    pub fn new(activity_type: AgentActivityType, message: impl Into<String>) -> Self {
        Self { activity_type, message: message.into(), timestamp: now_ms(), data: None }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.get_or_insert_with(HashMap::new).insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum PipelineEvent {
    #[serde(rename = "data:tick")]
    Tick(Tick),
    #[serde(rename = "anomaly:detected")]
    Anomaly(Anomaly),
    #[serde(rename = "agent:activity")]
    Activity(AgentActivity),
    #[serde(rename = "source:health-change")]
    SourceHealth(SourceHealth),
    #[serde(rename = "source:error", rename_all = "camelCase")]
    SourceError { source_id: String, error: String },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            | PipelineEvent::Tick(_) => event_names::DATA_TICK,
            | PipelineEvent::Anomaly(_) => event_names::ANOMALY_DETECTED,
            | PipelineEvent::Activity(_) => event_names::AGENT_ACTIVITY,
            | PipelineEvent::SourceHealth(_) => event_names::SOURCE_HEALTH_CHANGE,
            | PipelineEvent::SourceError { .. } => event_names::SOURCE_ERROR,
        }
    }
}

/// Fan-out of [`PipelineEvent`]s. Publishing with no subscribers is not an
/// error; slow subscribers lag and lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn publish(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn tick(&self, tick: Tick) {
        self.publish(PipelineEvent::Tick(tick));
    }

    pub fn anomaly(&self, anomaly: Anomaly) {
        self.publish(PipelineEvent::Anomaly(anomaly));
    }

    pub fn activity(&self, activity: AgentActivity) {
        self.publish(PipelineEvent::Activity(activity));
    }

    pub fn source_health(&self, health: SourceHealth) {
        self.publish(PipelineEvent::SourceHealth(health));
    }

    pub fn source_error(&self, source_id: impl Into<String>, error: impl Into<String>) {
        self.publish(PipelineEvent::SourceError { source_id: source_id.into(), error: error.into() });
    }
}
