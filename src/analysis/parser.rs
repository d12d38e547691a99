//! Extracts the anomaly array from free-form model output.
//!
//! Accepted shapes, tried in order: a fenced code block holding an array,
//! the whole reply as a bare array, then the first parseable array embedded
//! in prose. Anything else is a hard parse failure.

use super::Severity;
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// A validated anomaly as the model described it, before stamping.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAnomaly {
    pub severity: Severity,
    pub source: String,
    pub symbol: Option<String>,
    pub description: String,
    pub metrics: HashMap<String, f64>,
    pub pre_screen_score: Option<f64>,
}

fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        // skip the info string (```json)
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
        let body = &after[body_start..];
        match body.find("```") {
            | Some(end) => {
                blocks.push(&body[..end]);
                rest = &body[end + 3..];
            }
            | None => break,
        }
    }
    blocks
}

fn embedded_array(text: &str) -> Option<Vec<Value>> {
    for (i, _) in text.match_indices('[') {
        let mut values = serde_json::Deserializer::from_str(&text[i..]).into_iter::<Value>();
        if let Some(Ok(Value::Array(items))) = values.next() {
            return Some(items);
        }
    }
    None
}

fn extract_array(text: &str) -> Result<Vec<Value>> {
    for block in fenced_blocks(text) {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(block.trim()) {
            return Ok(items);
        }
    }
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text.trim()) {
        return Ok(items);
    }
    embedded_array(text).ok_or_else(|| {
        let preview: String = text.chars().take(120).collect();
        Error::ResponseParse(format!("no JSON array in model response: {:?}", preview))
    })
}

fn non_empty_str(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

fn validate(item: &Value) -> std::result::Result<ParsedAnomaly, &'static str> {
    if !item.is_object() {
        return Err("not an object");
    }
    let severity = item.get("severity").and_then(Value::as_str).and_then(Severity::parse).ok_or("bad severity")?;
    let source = non_empty_str(item, "source").ok_or("missing source")?;
    let description = non_empty_str(item, "description").ok_or("missing description")?;
    let metrics = item
        .get("metrics")
        .and_then(Value::as_object)
        .ok_or("metrics is not an object")?
        .iter()
        .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
        .collect();
    let pre_screen_score = item
        .get("preScreenScore")
        .or_else(|| item.get("pre_screen_score"))
        .and_then(Value::as_f64)
        .map(|s| s.clamp(0.0, 1.0));
    Ok(ParsedAnomaly {
        severity,
        source,
        symbol: non_empty_str(item, "symbol").map(|s| s.to_uppercase()),
        description,
        metrics,
        pre_screen_score,
    })
}

/// Parse and validate. Invalid entries are dropped; order is preserved.
pub fn parse_anomalies(text: &str) -> Result<Vec<ParsedAnomaly>> {
    let items = extract_array(text)?;
    let total = items.len();
    let parsed: Vec<ParsedAnomaly> = items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| match validate(item) {
            | Ok(a) => Some(a),
            | Err(reason) => {
                debug!(index = i, reason, "dropping invalid anomaly");
                None
            }
        })
        .collect();
    if parsed.len() < total {
        debug!(kept = parsed.len(), total, "some anomalies failed validation");
    }
    Ok(parsed)
}
