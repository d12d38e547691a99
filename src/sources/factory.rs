//! Compile-time registry of source implementations keyed by plugin id.

use super::alpaca_rest::AlpacaRestSource;
use super::alpaca_stream::AlpacaStreamSource;
use super::file::CsvFileSource;
use super::Source;
use crate::utils::types::{SourceConfig, SourceKind};
use crate::{Error, Result};
use std::sync::Arc;

pub const CSV_FILE: &str = "csv-file";
pub const ALPACA_STREAM: &str = "alpaca-stream";
pub const ALPACA_REST: &str = "alpaca-rest";

/// Plugin ids this build knows how to construct, with the kind each must be.
pub const KNOWN_PLUGINS: &[(&str, SourceKind)] = &[
    (CSV_FILE, SourceKind::File),
    (ALPACA_STREAM, SourceKind::Streaming),
    (ALPACA_REST, SourceKind::Polling),
];

pub fn create_source(config: SourceConfig) -> Result<Arc<dyn Source>> {
    let expected = KNOWN_PLUGINS
        .iter()
        .find(|(id, _)| *id == config.plugin_id)
        .map(|(_, kind)| *kind)
        .ok_or_else(|| Error::UnknownSourcePlugin(config.plugin_id.clone()))?;
    if expected != config.kind {
        return Err(Error::ConfigError(format!(
            "source {}: plugin {} is a {:?} source, not {:?}",
            config.id, config.plugin_id, expected, config.kind
        )));
    }
    let source: Arc<dyn Source> = match config.plugin_id.as_str() {
        | CSV_FILE => Arc::new(CsvFileSource::new(config)?),
        | ALPACA_STREAM => Arc::new(AlpacaStreamSource::new(config)?),
        | ALPACA_REST => Arc::new(AlpacaRestSource::new(config)?),
        | other => return Err(Error::UnknownSourcePlugin(other.to_string())),
    };
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn unknown_plugin_is_rejected() {
        let cfg = SourceConfig::new("x", SourceKind::Polling, "yahoo-scraper");
        assert_matches!(create_source(cfg).map(|_| ()), Err(Error::UnknownSourcePlugin(p)) if p == "yahoo-scraper");
    }

    #[test]
    fn kind_must_match_plugin() {
        let cfg = SourceConfig::new("x", SourceKind::Streaming, CSV_FILE).with_setting("path", json!("/tmp/a.csv"));
        assert_matches!(create_source(cfg).map(|_| ()), Err(Error::ConfigError(_)));
    }

    #[test]
    fn builds_known_plugins() {
        let csv = SourceConfig::new("file", SourceKind::File, CSV_FILE).with_setting("path", json!("/tmp/a.csv"));
        assert_eq!(create_source(csv).unwrap().id(), "file");

        let stream = SourceConfig::new("ws", SourceKind::Streaming, ALPACA_STREAM)
            .with_setting("key_id", json!("k"))
            .with_setting("secret_key", json!("s"))
            .with_setting("symbols", json!(["AAPL"]));
        assert_eq!(create_source(stream).unwrap().config().kind, SourceKind::Streaming);

        let rest = SourceConfig::new("rest", SourceKind::Polling, ALPACA_REST)
            .with_setting("key_id", json!("k"))
            .with_setting("secret_key", json!("s"))
            .with_setting("symbols", json!("AAPL,MSFT"));
        assert_eq!(create_source(rest).unwrap().id(), "rest");
    }
}
