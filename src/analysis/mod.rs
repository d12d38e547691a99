//! Anomaly analysis: prompt construction, response parsing and the cycle
//! orchestrator that turns one batch into zero or more anomalies.

pub mod orchestrator;
pub mod parser;
pub mod prompt;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub use orchestrator::{CycleOrchestrator, CycleResult, CycleState};
pub use parser::{parse_anomalies, ParsedAnomaly};

pub const DEFAULT_MODEL: &str = "claude-3-5-haiku-20241022";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            | "low" => Some(Severity::Low),
            | "medium" => Some(Severity::Medium),
            | "high" => Some(Severity::High),
            | "critical" => Some(Severity::Critical),
            | _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub id: String,
    pub session_id: String,
    pub timestamp: u64,
    pub severity: Severity,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub description: String,
    pub metrics: HashMap<String, f64>,
    pub pre_screen_score: f64,
}

/// Settings for the model call made on every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Domain patterns the model should look for, one per entry.
    pub patterns: Vec<String>,
    /// Named numeric thresholds quoted verbatim in the prompt.
    pub thresholds: BTreeMap<String, f64>,
    pub memory_context: Option<String>,
    pub enable_tools: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 4096,
            temperature: 0.3,
            patterns: Vec::new(),
            thresholds: BTreeMap::new(),
            memory_context: None,
            enable_tools: true,
        }
    }
}
