//! Statistical pre-screen run over a batch before any model call.
//!
//! For each metric the population mean and standard deviation are taken
//! across the ticks that carry it. A tick's score is its largest absolute
//! z-score scaled by `z_score_threshold` and clipped to 1.

use crate::utils::types::Tick;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreScreenConfig {
    pub z_score_threshold: f64,
    pub urgent_threshold: f64,
    pub skip_threshold: f64,
}

impl Default for PreScreenConfig {
    fn default() -> Self {
        Self { z_score_threshold: 3.0, urgent_threshold: 0.6, skip_threshold: 0.2 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Skip,
    Normal,
    Urgent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredTick {
    pub tick: Tick,
    pub z_scores: HashMap<String, f64>,
    pub score: f64,
    pub classification: Classification,
}

#[derive(Debug, Clone, Copy, Default)]
struct MetricStats {
    mean: f64,
    std_dev: f64,
}

fn batch_stats(ticks: &[Tick]) -> HashMap<&str, MetricStats> {
    let mut values: HashMap<&str, Vec<f64>> = HashMap::new();
    for tick in ticks {
        for (name, v) in &tick.metrics {
            if v.is_finite() {
                values.entry(name.as_str()).or_default().push(*v);
            }
        }
    }
    values
        .into_iter()
        .map(|(name, vs)| {
            let n = vs.len() as f64;
            let mean = vs.iter().sum::<f64>() / n;
            // sum/n rounds for most fractions, so a flat column must be caught exactly.
            let flat = vs.iter().all(|v| *v == vs[0]);
            let std_dev = if flat {
                0.0
            } else {
                (vs.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
            };
            (name, MetricStats { mean, std_dev })
        })
        .collect()
}

pub fn classify(score: f64, config: &PreScreenConfig) -> Classification {
    if score < config.skip_threshold {
        Classification::Skip
    } else if score >= config.urgent_threshold {
        Classification::Urgent
    } else {
        Classification::Normal
    }
}

/// Score every tick of a batch. Pure: nothing is retained between calls.
pub fn pre_screen(ticks: &[Tick], config: &PreScreenConfig) -> Vec<ScoredTick> {
    let stats = batch_stats(ticks);
    ticks
        .iter()
        .map(|tick| {
            let mut z_scores = HashMap::with_capacity(tick.metrics.len());
            let mut max_abs_z: f64 = 0.0;
            for (name, v) in &tick.metrics {
                let Some(s) = stats.get(name.as_str()) else { continue };
                let z = if s.std_dev > 0.0 && v.is_finite() { (v - s.mean) / s.std_dev } else { 0.0 };
                max_abs_z = max_abs_z.max(z.abs());
                z_scores.insert(name.clone(), z);
            }
            let score = if config.z_score_threshold > 0.0 {
                (max_abs_z / config.z_score_threshold).min(1.0)
            } else if max_abs_z > 0.0 {
                1.0
            } else {
                0.0
            };
            ScoredTick {
                tick: tick.clone(),
                z_scores,
                score,
                classification: classify(score, config),
            }
        })
        .collect()
}
