//! Core data types shared across sources, the buffer and the analysis cycle.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One timestamped observation from a source.
///
/// Ticks are immutable once a source has produced them; the buffer hands
/// them to the analysis cycle and drops them after the flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub source_id: String,
    /// Epoch milliseconds
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub metrics: HashMap<String, f64>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl Tick {
    pub fn new(source_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            source_id: source_id.into(),
            timestamp,
            symbol: None,
            metrics: HashMap::new(),
            metadata: HashMap::new(),
            raw: None,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Polling,
    Streaming,
    File,
}

/// Registration record for a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    pub id: String,
    /// Display name; empty means "same as id".
    #[serde(default)]
    pub name: String,
    pub kind: SourceKind,
    #[serde(alias = "plugin_id")]
    pub plugin_id: String,
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "poll_interval_ms")]
    pub poll_interval_ms: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn new(id: impl Into<String>, kind: SourceKind, plugin_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            plugin_id: plugin_id.into(),
            settings: HashMap::new(),
            enabled: true,
            poll_interval_ms: None,
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = Some(ms);
        self
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }

    pub fn setting_u64(&self, key: &str) -> Option<u64> {
        self.settings.get(key).and_then(|v| v.as_u64())
    }

    /// A string-array setting; a single comma separated string is accepted too.
    pub fn setting_list(&self, key: &str) -> Vec<String> {
        match self.settings.get(key) {
            | Some(serde_json::Value::Array(items)) => {
                items.iter().filter_map(|v| v.as_str().map(String::from)).collect()
            }
            | Some(serde_json::Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            | _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceHealthStatus {
    Healthy,
    Degraded,
    Offline,
}

/// Point-in-time health of one source, recomputed on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceHealth {
    pub source_id: String,
    pub status: SourceHealthStatus,
    pub last_success: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<u64>,
    pub fail_count: u32,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SourceHealth {
    pub fn offline(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            status: SourceHealthStatus::Offline,
            last_success: 0,
            last_failure: Some(crate::utils::time::now_ms()),
            fail_count: 0,
            latency_ms: 0,
            message: Some(message.into()),
        }
    }
}
