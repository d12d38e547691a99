//! Prompt construction for one analysis cycle.

use super::AnalysisConfig;
use crate::ingest::prescreen::{Classification, ScoredTick};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Write;

const ROLE: &str = "You are a market-data surveillance analyst. You receive batches of \
timestamped observations that a statistical pre-screen has already scored, and you report \
genuine anomalies: unusual price moves, volume spikes, spread blow-outs, gaps, stale or \
inconsistent data.";

const OUTPUT_CONTRACT: &str = "Reply with a JSON array and nothing else. Each element is an object with:\n\
- \"severity\": one of \"low\", \"medium\", \"high\", \"critical\"\n\
- \"source\": the source id the anomaly came from\n\
- \"symbol\": the instrument symbol, if any\n\
- \"description\": one or two sentences explaining what is anomalous\n\
- \"metrics\": an object of the numeric values that support the finding\n\
- \"preScreenScore\": the pre-screen score of the tick(s) involved, if relevant\n\
Return [] when nothing in the batch is anomalous.";

pub fn system_prompt(config: &AnalysisConfig, tools_available: bool) -> String {
    let mut out = String::from(ROLE);
    if !config.patterns.is_empty() {
        out.push_str("\n\nPatterns to watch for:\n");
        for p in &config.patterns {
            let _ = writeln!(out, "- {}", p);
        }
    }
    if !config.thresholds.is_empty() {
        out.push_str("\nThresholds:\n");
        for (name, value) in &config.thresholds {
            let _ = writeln!(out, "- {}: {}", name, value);
        }
    }
    if tools_available {
        out.push_str(
            "\nIndicator tools are available. Call them when a computed indicator would \
             confirm or rule out a finding; you do not need to call any.",
        );
    }
    out.push_str("\n\n");
    out.push_str(OUTPUT_CONTRACT);
    out
}

fn tick_line(s: &ScoredTick) -> String {
    let z: BTreeMap<&str, f64> = s.z_scores.iter().map(|(k, v)| (k.as_str(), round3(*v))).collect();
    let metrics: BTreeMap<&str, f64> = s.tick.metrics.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    json!({
        "source": s.tick.source_id,
        "symbol": s.tick.symbol,
        "timestamp": s.tick.timestamp,
        "metrics": metrics,
        "zScores": z,
        "score": round3(s.score),
        "classification": s.classification,
    })
    .to_string()
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// The per-batch user message. Skipped ticks are only counted per source so
/// the prompt stays proportional to the interesting part of the batch.
pub fn user_prompt(batch_number: u64, scored: &[ScoredTick], memory_context: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(ctx) = memory_context.map(str::trim).filter(|c| !c.is_empty()) {
        let _ = writeln!(out, "Context from earlier sessions:\n{}\n", ctx);
    }

    let urgent = scored.iter().filter(|s| s.classification == Classification::Urgent).count();
    let skipped: Vec<&ScoredTick> = scored.iter().filter(|s| s.classification == Classification::Skip).collect();
    let _ = writeln!(
        out,
        "Batch #{}: {} ticks ({} urgent, {} normal, {} skipped by pre-screen).",
        batch_number,
        scored.len(),
        urgent,
        scored.len() - urgent - skipped.len(),
        skipped.len()
    );

    let detailed: Vec<&ScoredTick> = scored.iter().filter(|s| s.classification != Classification::Skip).collect();
    if !detailed.is_empty() {
        out.push_str("\nScored ticks (one JSON object per line):\n");
        for s in detailed {
            out.push_str(&tick_line(s));
            out.push('\n');
        }
    }

    if !skipped.is_empty() {
        let mut per_source: BTreeMap<&str, usize> = BTreeMap::new();
        for s in &skipped {
            *per_source.entry(s.tick.source_id.as_str()).or_default() += 1;
        }
        out.push_str("\nUnremarkable ticks omitted:\n");
        for (source, n) in per_source {
            let _ = writeln!(out, "- {}: {}", source, n);
        }
    }
    out
}
