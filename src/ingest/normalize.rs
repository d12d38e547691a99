//! Tick normalization applied to everything a source emits.

use crate::utils::types::Tick;
use crate::{Error, Result};

/// Enforce the tick invariants: positive timestamp, at least one finite
/// metric, symbol trimmed and upper-cased (blank symbols become `None`).
pub fn normalize_tick(mut tick: Tick) -> Result<Tick> {
    if tick.timestamp == 0 {
        return Err(Error::DataError(format!("tick from {} has no timestamp", tick.source_id)));
    }
    tick.metrics.retain(|_, v| v.is_finite());
    if tick.metrics.is_empty() {
        return Err(Error::DataError(format!("tick from {} has no metrics", tick.source_id)));
    }
    tick.symbol = tick
        .symbol
        .take()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty());
    Ok(tick)
}

/// Normalize a fetched group, dropping ticks that violate the invariants.
pub fn normalize_all(ticks: Vec<Tick>) -> Vec<Tick> {
    ticks
        .into_iter()
        .filter_map(|t| match normalize_tick(t) {
            | Ok(t) => Some(t),
            | Err(e) => {
                tracing::debug!(error = %e, "dropping malformed tick");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn symbol_is_trimmed_and_upper_cased() {
        let t = Tick::new("s", 1).with_symbol("  aapl ").with_metric("close", 1.0);
        assert_eq!(normalize_tick(t).unwrap().symbol.as_deref(), Some("AAPL"));
    }

    #[test]
    fn blank_symbol_becomes_none() {
        let t = Tick::new("s", 1).with_symbol("   ").with_metric("close", 1.0);
        assert!(normalize_tick(t).unwrap().symbol.is_none());
    }

    #[test]
    fn rejects_missing_metrics_and_timestamp() {
        assert_matches!(normalize_tick(Tick::new("s", 1)), Err(Error::DataError(_)));
        let t = Tick::new("s", 0).with_metric("close", 1.0);
        assert_matches!(normalize_tick(t), Err(Error::DataError(_)));
        let t = Tick::new("s", 5).with_metric("close", f64::NAN);
        assert_matches!(normalize_tick(t), Err(Error::DataError(_)));
    }

    #[test]
    fn normalize_all_keeps_order_and_drops_bad() {
        let ticks = vec![
            Tick::new("s", 1).with_metric("a", 1.0),
            Tick::new("s", 0).with_metric("a", 2.0),
            Tick::new("s", 3).with_metric("a", 3.0),
        ];
        let out = normalize_all(ticks);
        assert_eq!(out.iter().map(|t| t.timestamp).collect::<Vec<_>>(), vec![1, 3]);
    }
}
