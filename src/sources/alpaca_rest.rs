//! Alpaca REST bars poller used for backfill and for feeds without a socket.
//!
//! Each fetch asks for bars since the newest one already returned per
//! symbol, so repeated polls only yield new bars.

use super::{HealthTracker, Source};
use crate::utils::time::{now_ms, parse_timestamp_ms};
use crate::utils::types::{SourceConfig, SourceHealth, Tick};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

const MAX_PAGES: usize = 10;

#[derive(Debug, Clone)]
pub struct AlpacaRestSettings {
    pub key_id: String,
    pub secret_key: String,
    pub symbols: Vec<String>,
    pub timeframe: String,
    pub feed: String,
    pub base_url: String,
    pub lookback_minutes: u64,
    pub limit: u64,
    pub timeout: Duration,
}

impl AlpacaRestSettings {
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        let key_id = config
            .setting_str("key_id")
            .map(String::from)
            .or_else(|| std::env::var("APCA_API_KEY_ID").ok())
            .ok_or_else(|| Error::ConfigError(format!("source {}: missing Alpaca key id", config.id)))?;
        let secret_key = config
            .setting_str("secret_key")
            .map(String::from)
            .or_else(|| std::env::var("APCA_API_SECRET_KEY").ok())
            .ok_or_else(|| Error::ConfigError(format!("source {}: missing Alpaca secret key", config.id)))?;
        let symbols: Vec<String> =
            config.setting_list("symbols").into_iter().map(|s| s.trim().to_uppercase()).collect();
        if symbols.is_empty() {
            return Err(Error::ConfigError(format!("source {}: no symbols configured", config.id)));
        }
        let base_url = config
            .setting_str("base_url")
            .unwrap_or("https://data.alpaca.markets")
            .trim_end_matches('/')
            .to_string();
        url::Url::parse(&base_url)?;
        Ok(Self {
            key_id,
            secret_key,
            symbols,
            timeframe: config.setting_str("timeframe").unwrap_or("1Min").to_string(),
            feed: config.setting_str("feed").unwrap_or("iex").to_string(),
            base_url,
            lookback_minutes: config.setting_u64("lookback_minutes").unwrap_or(60),
            limit: config.setting_u64("limit").unwrap_or(1_000),
            timeout: Duration::from_secs(config.setting_u64("timeout_secs").unwrap_or(10)),
        })
    }
}

#[derive(Debug, Deserialize)]
struct BarsResponse {
    #[serde(default)]
    bars: HashMap<String, Vec<RestBar>>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RestBar {
    t: String,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
    #[serde(default)]
    n: Option<f64>,
    #[serde(default)]
    vw: Option<f64>,
}

pub struct AlpacaRestSource {
    config: SourceConfig,
    settings: AlpacaRestSettings,
    client: reqwest::Client,
    last_seen: Mutex<HashMap<String, u64>>,
    running: AtomicBool,
    health: HealthTracker,
}

impl AlpacaRestSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let settings = AlpacaRestSettings::from_config(&config)?;
        let client = reqwest::Client::builder().timeout(settings.timeout).build()?;
        Ok(Self {
            config,
            settings,
            client,
            last_seen: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            health: HealthTracker::default(),
        })
    }

    fn window_start_ms(&self) -> u64 {
        let fallback = now_ms().saturating_sub(self.settings.lookback_minutes * 60_000);
        let seen = self.last_seen.lock();
        self.settings
            .symbols
            .iter()
            .map(|s| seen.get(s).map(|t| t + 1).unwrap_or(fallback))
            .min()
            .unwrap_or(fallback)
    }

    async fn fetch_page(&self, start: &str, page_token: Option<&str>) -> Result<BarsResponse> {
        let url = format!("{}/v2/stocks/bars", self.settings.base_url);
        let limit = self.settings.limit.to_string();
        let symbols = self.settings.symbols.join(",");
        let mut query = vec![
            ("symbols", symbols.as_str()),
            ("timeframe", self.settings.timeframe.as_str()),
            ("start", start),
            ("limit", limit.as_str()),
            ("feed", self.settings.feed.as_str()),
        ];
        if let Some(token) = page_token {
            query.push(("page_token", token));
        }
        let resp = self
            .client
            .get(&url)
            .header("APCA-API-KEY-ID", &self.settings.key_id)
            .header("APCA-API-SECRET-KEY", &self.settings.secret_key)
            .query(&query)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::ConnectionError(format!("alpaca http {}: {}", status, body)));
        }
        Ok(resp.json::<BarsResponse>().await?)
    }

    async fn fetch_new_bars(&self) -> Result<Vec<Tick>> {
        let start_ms = self.window_start_ms();
        let start = Utc
            .timestamp_millis_opt(start_ms as i64)
            .single()
            .ok_or_else(|| Error::DataError(format!("bad window start {}", start_ms)))?
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        let mut by_symbol: HashMap<String, Vec<RestBar>> = HashMap::new();
        let mut token: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let page = self.fetch_page(&start, token.as_deref()).await?;
            for (sym, bars) in page.bars {
                by_symbol.entry(sym.to_uppercase()).or_default().extend(bars);
            }
            token = page.next_page_token.filter(|t| !t.is_empty());
            if token.is_none() {
                break;
            }
        }

        let mut seen = self.last_seen.lock();
        let mut ticks = Vec::new();
        for symbol in &self.settings.symbols {
            let Some(bars) = by_symbol.remove(symbol) else { continue };
            let mut rows: Vec<(u64, RestBar)> =
                bars.into_iter().filter_map(|b| parse_timestamp_ms(&b.t).map(|ts| (ts, b))).collect();
            rows.sort_by_key(|(ts, _)| *ts);
            let last = seen.get(symbol).copied().unwrap_or(0);
            for (ts, bar) in rows.into_iter().filter(|(ts, _)| *ts > last) {
                let mut tick = Tick::new(&self.config.id, ts)
                    .with_symbol(symbol.clone())
                    .with_metric("open", bar.o)
                    .with_metric("high", bar.h)
                    .with_metric("low", bar.l)
                    .with_metric("close", bar.c)
                    .with_metric("volume", bar.v)
                    .with_metadata("type", serde_json::json!("bar"))
                    .with_metadata("timeframe", serde_json::json!(self.settings.timeframe));
                if let Some(n) = bar.n {
                    tick = tick.with_metric("trade_count", n);
                }
                if let Some(vw) = bar.vw {
                    tick = tick.with_metric("vwap", vw);
                }
                seen.insert(symbol.clone(), ts);
                ticks.push(tick);
            }
        }
        debug!(source_id = %self.config.id, count = ticks.len(), "backfill poll complete");
        Ok(ticks)
    }
}

#[async_trait]
impl Source for AlpacaRestSource {
    fn config(&self) -> &SourceConfig {
        &self.config
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<Tick>> {
        let started = Instant::now();
        match self.fetch_new_bars().await {
            | Ok(ticks) => {
                self.health.record_success(started.elapsed().as_millis() as u64);
                Ok(ticks)
            }
            | Err(e) => {
                self.health.record_failure(e.to_string());
                Err(e)
            }
        }
    }

    async fn health_check(&self) -> Result<SourceHealth> {
        Ok(self.health.snapshot(&self.config.id, self.running.load(Ordering::SeqCst)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::types::{SourceHealthStatus, SourceKind};
    use axum::{extract::Query, http::HeaderMap, http::StatusCode, routing::get, Json, Router};
    use serde_json::json;
    use std::net::SocketAddr;

    async fn bars_handler(
        headers: HeaderMap,
        Query(q): Query<HashMap<String, String>>,
    ) -> std::result::Result<Json<serde_json::Value>, StatusCode> {
        if headers.get("APCA-API-KEY-ID").and_then(|v| v.to_str().ok()) != Some("KEY") {
            return Err(StatusCode::UNAUTHORIZED);
        }
        assert_eq!(q.get("symbols").map(String::as_str), Some("AAPL,MSFT"));
        Ok(Json(json!({
            "bars": {
                "AAPL": [
                    {"t":"2024-02-01T15:07:00Z","o":2,"h":2,"l":2,"c":2,"v":20},
                    {"t":"2024-02-01T15:06:00Z","o":1,"h":1,"l":1,"c":1,"v":10,"n":3,"vw":1.0}
                ],
                "MSFT": [{"t":"2024-02-01T15:06:00Z","o":400,"h":401,"l":399,"c":400.5,"v":5}]
            },
            "next_page_token": null
        })))
    }

    async fn spawn_stub() -> SocketAddr {
        let app = Router::new().route("/v2/stocks/bars", get(bars_handler));
        let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(app.into_make_service());
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    fn source(addr: SocketAddr, key: &str) -> AlpacaRestSource {
        let cfg = SourceConfig::new("alpaca-rest", SourceKind::Polling, "alpaca-rest")
            .with_setting("key_id", json!(key))
            .with_setting("secret_key", json!("SECRET"))
            .with_setting("symbols", json!(["aapl", "msft"]))
            .with_setting("base_url", json!(format!("http://{}", addr)));
        AlpacaRestSource::new(cfg).unwrap()
    }

    #[tokio::test]
    async fn returns_only_new_bars_in_time_order() {
        let addr = spawn_stub().await;
        let src = source(addr, "KEY");
        src.start().await.unwrap();

        let ticks = src.fetch().await.unwrap();
        assert_eq!(ticks.len(), 3);
        assert_eq!(ticks[0].symbol.as_deref(), Some("AAPL"));
        assert_eq!(ticks[0].metrics["close"], 1.0);
        assert_eq!(ticks[0].metrics["trade_count"], 3.0);
        assert_eq!(ticks[1].metrics["close"], 2.0);
        assert_eq!(ticks[2].symbol.as_deref(), Some("MSFT"));

        assert!(src.fetch().await.unwrap().is_empty());
        assert_eq!(src.health_check().await.unwrap().status, SourceHealthStatus::Healthy);
    }

    #[tokio::test]
    async fn http_errors_surface_as_fetch_failures() {
        let addr = spawn_stub().await;
        let src = source(addr, "WRONG");
        src.start().await.unwrap();
        let err = src.fetch().await.unwrap_err();
        assert!(err.to_string().contains("401"));
        assert_eq!(src.health_check().await.unwrap().status, SourceHealthStatus::Degraded);
    }
}
