//! Configuration template generation

use crate::utils::error::Result;
use std::fs;
use std::path::Path;

/// Commented default configuration. Every value shown is the built-in
/// default unless marked otherwise.
pub const DEFAULT_CONFIG_TOML: &str = r#"# tickscope configuration
# Values shown are the defaults. API keys are read from the environment
# (a .env file in the working directory is loaded first).

[buffer]
# Deliver a batch to the analysis loop at least this often (ms)
flush_interval_ms = 5000
# Ticks whose pre-screen score reaches this value flush the buffer at once
urgent_threshold = 0.6

[scheduler]
# Poll interval for sources that do not set poll_interval_ms
default_poll_interval_ms = 60000
# After n consecutive failures the next poll waits base * multiplier^n ...
backoff_multiplier = 2.0
# ... but never longer than this
max_backoff_ms = 300000

[prescreen]
# |z| at which a metric counts as fully anomalous (score 1.0)
z_score_threshold = 3.0
# score >= urgent_threshold -> urgent
urgent_threshold = 0.6
# score < skip_threshold -> skip (summarised, not detailed, in the prompt)
skip_threshold = 0.2

[analysis]
model = "claude-3-5-haiku-20241022"
max_tokens = 4096
temperature = 0.3
# Offer rsi, bollinger_bands, macd and atr tools to the model
enable_tools = true
# Domain patterns the model should look for
patterns = [
    "volume more than 5x the recent average",
    "price gap larger than 2% between consecutive bars",
]
# memory_context = "Notes carried over from earlier sessions"

[analysis.thresholds]
# Quoted verbatim in the prompt
max_spread_bps = 25.0

[monitor]
# Set to false to ingest without running analysis cycles
enabled = true

[metrics]
# Install the Prometheus recorder (`tickscope run --metrics` forces this on)
enabled = false

# Providers are tried in order; the first that completes a response wins.
[[providers]]
id = "anthropic"
type = "anthropic"
api_key_env = "ANTHROPIC_API_KEY"
timeout_secs = 60

[[providers]]
id = "openrouter"
type = "openrouter"
api_key_env = "OPENROUTER_API_KEY"
# base_url = "https://openrouter.ai/api"
timeout_secs = 90

[[sources]]
id = "csv"
kind = "file"
plugin_id = "csv-file"
poll_interval_ms = 5000
[sources.settings]
path = "data/bars.csv"
symbol = "AAPL"
delimiter = ","
# Map logical columns to header names
# columns = { timestamp = "time", close = "last" }

[[sources]]
id = "alpaca"
kind = "streaming"
plugin_id = "alpaca-stream"
enabled = false
# How often buffered stream ticks are drained (ms)
poll_interval_ms = 1000
[sources.settings]
# key_id / secret_key default to APCA_API_KEY_ID / APCA_API_SECRET_KEY
feed = "iex"
symbols = ["AAPL", "MSFT"]
channels = ["bars", "trades"]
reconnect_base_ms = 1000
# 0 retries forever
max_reconnect_attempts = 10
max_buffered_ticks = 10000

[[sources]]
id = "alpaca-backfill"
kind = "polling"
plugin_id = "alpaca-rest"
enabled = false
poll_interval_ms = 60000
[sources.settings]
symbols = "AAPL,MSFT"
timeframe = "1Min"
feed = "iex"
lookback_minutes = 60
"#;

/// Write the commented template to `path`, creating parent directories.
pub fn generate_commented_config_template<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}
