//! Technical-indicator tools the model can call over a numeric series it
//! already has in the prompt.

use super::tools::ToolRegistry;
use serde::Deserialize;
use serde_json::{json, Value};
use ta::indicators::{AverageTrueRange, BollingerBands, MovingAverageConvergenceDivergence, RelativeStrengthIndex};
use ta::{DataItem, Next};

fn series_schema(extra: Value) -> Value {
    let mut schema = json!({
        "type": "object",
        "properties": {
            "values": {"type": "array", "items": {"type": "number"}, "description": "Oldest first"}
        },
        "required": ["values"]
    });
    if let (Some(props), Some(extra)) = (schema["properties"].as_object_mut(), extra.as_object()) {
        props.extend(extra.clone());
    }
    schema
}

#[derive(Debug, Deserialize)]
struct RsiArgs {
    values: Vec<f64>,
    #[serde(default = "default_rsi_period")]
    period: usize,
}

fn default_rsi_period() -> usize {
    14
}

#[derive(Debug, Deserialize)]
struct BollingerArgs {
    values: Vec<f64>,
    #[serde(default = "default_bb_period")]
    period: usize,
    #[serde(default = "default_bb_k")]
    k: f64,
}

fn default_bb_period() -> usize {
    20
}

fn default_bb_k() -> f64 {
    2.0
}

#[derive(Debug, Deserialize)]
struct MacdArgs {
    values: Vec<f64>,
    #[serde(default = "default_fast")]
    fast: usize,
    #[serde(default = "default_slow")]
    slow: usize,
    #[serde(default = "default_signal")]
    signal: usize,
}

fn default_fast() -> usize {
    12
}

fn default_slow() -> usize {
    26
}

fn default_signal() -> usize {
    9
}

#[derive(Debug, Deserialize)]
struct AtrArgs {
    high: Vec<f64>,
    low: Vec<f64>,
    close: Vec<f64>,
    #[serde(default = "default_atr_period")]
    period: usize,
}

fn default_atr_period() -> usize {
    14
}

fn need(values: &[f64], n: usize) -> anyhow::Result<()> {
    if values.len() < n {
        anyhow::bail!("need at least {} values, got {}", n, values.len());
    }
    Ok(())
}

pub fn rsi(args: Value) -> anyhow::Result<Value> {
    let args: RsiArgs = serde_json::from_value(args)?;
    need(&args.values, args.period + 1)?;
    let mut rsi = RelativeStrengthIndex::new(args.period).map_err(|e| anyhow::anyhow!("{:?}", e))?;
    let value = args.values.iter().fold(0.0, |_, v| rsi.next(*v));
    let zone = if value >= 70.0 {
        "overbought"
    } else if value <= 30.0 {
        "oversold"
    } else {
        "neutral"
    };
    Ok(json!({"period": args.period, "value": value, "zone": zone}))
}

pub fn bollinger_bands(args: Value) -> anyhow::Result<Value> {
    let args: BollingerArgs = serde_json::from_value(args)?;
    need(&args.values, args.period)?;
    let mut bb = BollingerBands::new(args.period, args.k).map_err(|e| anyhow::anyhow!("{:?}", e))?;
    let mut out = None;
    for v in &args.values {
        out = Some(bb.next(*v));
    }
    let out = out.ok_or_else(|| anyhow::anyhow!("empty series"))?;
    let last = args.values[args.values.len() - 1];
    let width = out.upper - out.lower;
    let percent_b = if width > 1e-12 { (last - out.lower) / width } else { 0.5 };
    Ok(json!({
        "period": args.period,
        "k": args.k,
        "middle": out.average,
        "upper": out.upper,
        "lower": out.lower,
        "percentB": percent_b,
    }))
}

pub fn macd(args: Value) -> anyhow::Result<Value> {
    let args: MacdArgs = serde_json::from_value(args)?;
    if args.fast >= args.slow {
        anyhow::bail!("fast period must be shorter than slow period");
    }
    need(&args.values, args.slow)?;
    let mut macd = MovingAverageConvergenceDivergence::new(args.fast, args.slow, args.signal)
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;
    let mut out = None;
    for v in &args.values {
        out = Some(macd.next(*v));
    }
    let out = out.ok_or_else(|| anyhow::anyhow!("empty series"))?;
    Ok(json!({
        "macd": out.macd,
        "signal": out.signal,
        "histogram": out.histogram,
    }))
}

/// Average true range over parallel high/low/close series.
pub fn atr(args: Value) -> anyhow::Result<Value> {
    let args: AtrArgs = serde_json::from_value(args)?;
    if args.high.len() != args.close.len() || args.low.len() != args.close.len() {
        anyhow::bail!("high, low and close must have the same length");
    }
    need(&args.close, args.period + 1)?;
    let mut atr = AverageTrueRange::new(args.period).map_err(|e| anyhow::anyhow!("{:?}", e))?;
    let mut value = 0.0;
    for ((high, low), close) in args.high.iter().zip(&args.low).zip(&args.close) {
        let bar = DataItem::builder()
            .open(*close)
            .high(*high)
            .low(*low)
            .close(*close)
            .volume(0.0)
            .build()
            .map_err(|e| anyhow::anyhow!("invalid bar (high {high}, low {low}, close {close}): {:?}", e))?;
        value = atr.next(&bar);
    }
    let last = args.close[args.close.len() - 1];
    let percent = if last.abs() > 1e-12 { value / last * 100.0 } else { 0.0 };
    Ok(json!({"period": args.period, "value": value, "percentOfClose": percent}))
}

/// Register `rsi`, `bollinger_bands`, `macd` and `atr`.
pub fn register_builtin_tools(registry: &mut ToolRegistry) {
    registry.register_fn(
        "rsi",
        "Relative strength index of a price series; returns the latest value and its zone.",
        series_schema(json!({"period": {"type": "integer", "minimum": 2, "maximum": 200}})),
        rsi,
    );
    registry.register_fn(
        "bollinger_bands",
        "Bollinger bands of a price series; returns middle/upper/lower and %B of the last value.",
        series_schema(json!({
            "period": {"type": "integer", "minimum": 2, "maximum": 200},
            "k": {"type": "number", "minimum": 0.1, "maximum": 10}
        })),
        bollinger_bands,
    );
    registry.register_fn(
        "macd",
        "MACD line, signal line and histogram for a price series.",
        series_schema(json!({
            "fast": {"type": "integer", "minimum": 2, "maximum": 100},
            "slow": {"type": "integer", "minimum": 3, "maximum": 200},
            "signal": {"type": "integer", "minimum": 2, "maximum": 100}
        })),
        macd,
    );
    let series = json!({"type": "array", "items": {"type": "number"}, "description": "Oldest first"});
    registry.register_fn(
        "atr",
        "Average true range of high/low/close bars; returns the latest value and it as a percent of close.",
        json!({
            "type": "object",
            "properties": {
                "high": series.clone(),
                "low": series.clone(),
                "close": series,
                "period": {"type": "integer", "minimum": 1, "maximum": 200}
            },
            "required": ["high", "low", "close"]
        }),
        atr,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use assert_matches::assert_matches;

    fn rising(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64).collect()
    }

    #[tokio::test]
    async fn registered_in_order_and_callable() {
        let mut reg = ToolRegistry::new();
        register_builtin_tools(&mut reg);
        let names: Vec<String> = reg.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["rsi", "bollinger_bands", "macd", "atr"]);

        let out = reg.execute("rsi", json!({"values": rising(60)})).await.unwrap();
        assert!(out["value"].as_f64().unwrap() > 95.0);
        assert_eq!(out["zone"], "overbought");
    }

    #[tokio::test]
    async fn schema_rejects_bad_period() {
        let mut reg = ToolRegistry::new();
        register_builtin_tools(&mut reg);
        assert_matches!(
            reg.execute("rsi", json!({"values": rising(30), "period": 1})).await,
            Err(Error::ToolValidation { .. })
        );
        assert_matches!(reg.execute("macd", json!({"values": rising(5)})).await, Err(Error::ToolExecution { .. }));
    }

    #[test]
    fn flat_series_has_collapsed_bands_and_zero_macd() {
        let flat = vec![50.0; 40];
        let bb = bollinger_bands(json!({"values": flat.clone(), "period": 20})).unwrap();
        let width = bb["upper"].as_f64().unwrap() - bb["lower"].as_f64().unwrap();
        assert!(width.abs() < 1e-9);
        assert!((bb["middle"].as_f64().unwrap() - 50.0).abs() < 1e-9);
        assert_eq!(bb["percentB"].as_f64().unwrap(), 0.5);

        let m = macd(json!({"values": flat})).unwrap();
        assert!(m["histogram"].as_f64().unwrap().abs() < 1e-9);
    }

    #[tokio::test]
    async fn atr_schema_requires_all_three_series() {
        let mut reg = ToolRegistry::new();
        register_builtin_tools(&mut reg);
        assert_matches!(
            reg.execute("atr", json!({"high": [2.0], "close": [1.0]})).await,
            Err(Error::ToolValidation { message, .. }) if message.contains("low")
        );
        assert_matches!(
            reg.execute("atr", json!({"high": [2.0, 3.0], "low": [1.0], "close": [1.5, 2.5]})).await,
            Err(Error::ToolExecution { .. })
        );
    }

    #[test]
    fn constant_range_bars_have_that_atr() {
        let close = rising(30);
        let high: Vec<f64> = close.iter().map(|c| c + 1.0).collect();
        let low: Vec<f64> = close.iter().map(|c| c - 1.0).collect();
        // Closes rise by one, so every true range is the high-low span of 2.
        let out = atr(json!({"high": high, "low": low, "close": close, "period": 5})).unwrap();
        assert!((out["value"].as_f64().unwrap() - 2.0).abs() < 1e-9);
        assert_eq!(out["period"], 5);

        let err = atr(json!({"high": [1.0, 1.0], "low": [2.0, 2.0], "close": [1.5, 1.5], "period": 1})).unwrap_err();
        assert!(err.to_string().contains("invalid bar"));
    }
}
