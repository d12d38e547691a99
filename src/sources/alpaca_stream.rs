//! Alpaca market-data WebSocket source.
//!
//! Connection states run `Disconnected -> Connecting -> Connected ->
//! Authenticated`, with `Reconnecting` entered on any error or unexpected
//! close while the source is started. Credentials are only sent after the
//! server's `connected` greeting; the subscription only after
//! `authenticated`. Incoming bars, trades and quotes are normalized into
//! ticks and held until the next `fetch`.
//!
//! After `max_reconnect_attempts` consecutive failed reconnects the loop
//! gives up but the source stays started; health reports it offline until
//! it is stopped and started again. `max_reconnect_attempts = 0` retries
//! forever.

use super::Source;
use crate::utils::time::{now_ms, parse_timestamp_ms};
use crate::utils::types::{SourceConfig, SourceHealth, SourceHealthStatus, Tick};
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Bars,
    Trades,
    Quotes,
}

impl Channel {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            | "bars" | "bar" => Some(Channel::Bars),
            | "trades" | "trade" => Some(Channel::Trades),
            | "quotes" | "quote" => Some(Channel::Quotes),
            | _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            | Channel::Bars => "bars",
            | Channel::Trades => "trades",
            | Channel::Quotes => "quotes",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlpacaStreamSettings {
    pub key_id: String,
    pub secret_key: String,
    pub feed: String,
    pub symbols: Vec<String>,
    pub channels: Vec<Channel>,
    pub url: String,
    pub reconnect_base_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub max_buffered_ticks: usize,
}

/// Endpoint for a configured feed.
pub fn feed_url(feed: &str) -> String {
    match feed {
        | "crypto" => "wss://stream.data.alpaca.markets/v1beta3/crypto/us".to_string(),
        | other => format!("wss://stream.data.alpaca.markets/v2/{}", other),
    }
}

impl AlpacaStreamSettings {
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
        let feed = config.setting_str("feed").unwrap_or("iex").to_string();
        let symbols: Vec<String> =
            config.setting_list("symbols").into_iter().map(|s| s.trim().to_uppercase()).collect();
        if symbols.is_empty() {
            return Err(Error::ConfigError(format!("source {}: no symbols configured", config.id)));
        }
        let mut channels = Vec::new();
        for raw in config.setting_list("channels") {
            let ch = Channel::parse(&raw)
                .ok_or_else(|| Error::ConfigError(format!("source {}: unknown channel {}", config.id, raw)))?;
            if !channels.contains(&ch) {
                channels.push(ch);
            }
        }
        if channels.is_empty() {
            channels.push(Channel::Bars);
        }
        let url = config.setting_str("url").map(String::from).unwrap_or_else(|| feed_url(&feed));
        url::Url::parse(&url)?;
        Ok(Self {
            key_id,
            secret_key,
            feed,
            symbols,
            channels,
            url,
            reconnect_base_ms: config.setting_u64("reconnect_base_ms").unwrap_or(1_000),
            max_reconnect_delay_ms: config.setting_u64("max_reconnect_delay_ms").unwrap_or(60_000),
            max_reconnect_attempts: config.setting_u64("max_reconnect_attempts").unwrap_or(10) as u32,
            max_buffered_ticks: config.setting_u64("max_buffered_ticks").unwrap_or(10_000).max(1) as usize,
        })
    }

    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32));
        Duration::from_millis(self.reconnect_base_ms.saturating_mul(factor).min(self.max_reconnect_delay_ms))
    }

    fn auth_message(&self) -> String {
        json!({"action": "auth", "key": self.key_id, "secret": self.secret_key}).to_string()
    }

    fn subscribe_message(&self) -> String {
        let mut msg = serde_json::Map::new();
        msg.insert("action".into(), json!("subscribe"));
        for ch in &self.channels {
            msg.insert(ch.key().into(), json!(self.symbols));
        }
        Value::Object(msg).to_string()
    }
}

#[derive(Debug)]
struct StreamShared {
    state: ConnectionState,
    started: bool,
    authenticated: bool,
    fail_count: u32,
    reconnect_attempts: u32,
    gave_up: bool,
    buffer: VecDeque<Tick>,
    dropped: u64,
    last_success: u64,
    last_failure: Option<u64>,
    message: Option<String>,
}

impl Default for StreamShared {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            started: false,
            authenticated: false,
            fail_count: 0,
            reconnect_attempts: 0,
            gave_up: false,
            buffer: VecDeque::new(),
            dropped: 0,
            last_success: 0,
            last_failure: None,
            message: None,
        }
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct AlpacaStreamSource {
    config: SourceConfig,
    settings: Arc<AlpacaStreamSettings>,
    shared: Arc<Mutex<StreamShared>>,
    running: Mutex<Option<Running>>,
}

impl AlpacaStreamSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let settings = AlpacaStreamSettings::from_config(&config)?;
        Ok(Self {
            config,
            settings: Arc::new(settings),
            shared: Arc::new(Mutex::new(StreamShared::default())),
            running: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &AlpacaStreamSettings {
        &self.settings
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_authenticated(&self) -> bool {
        self.shared.lock().authenticated
    }

    /// True once the reconnect budget is spent while still started.
    pub fn reconnect_exhausted(&self) -> bool {
        self.shared.lock().gave_up
    }

    pub fn buffered(&self) -> usize {
        self.shared.lock().buffer.len()
    }
}

#[async_trait]
impl Source for AlpacaStreamSource {
    fn config(&self) -> &SourceConfig {
        &self.config
    }

    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        {
            let mut shared = self.shared.lock();
            *shared = StreamShared { started: true, state: ConnectionState::Connecting, ..Default::default() };
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(connection_loop(
            self.config.id.clone(),
            self.settings.clone(),
            self.shared.clone(),
            cancel.clone(),
        ));
        *running = Some(Running { cancel, handle });
        info!(source_id = %self.config.id, url = %self.settings.url, "stream source started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let running = self.running.lock().take();
        {
            let mut shared = self.shared.lock();
            shared.started = false;
            shared.authenticated = false;
            shared.buffer.clear();
        }
        if let Some(Running { cancel, handle }) = running {
            cancel.cancel();
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                warn!(source_id = %self.config.id, "connection task did not exit in time");
            }
            info!(source_id = %self.config.id, "stream source stopped");
        }
        self.shared.lock().state = ConnectionState::Disconnected;
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<Tick>> {
        Ok(self.shared.lock().buffer.drain(..).collect())
    }

    async fn health_check(&self) -> Result<SourceHealth> {
        let s = self.shared.lock();
        let status = if !s.started {
            SourceHealthStatus::Offline
        } else if s.authenticated && s.fail_count == 0 {
            SourceHealthStatus::Healthy
        } else if s.fail_count >= super::OFFLINE_FAILURE_COUNT || s.gave_up {
            SourceHealthStatus::Offline
        } else {
            SourceHealthStatus::Degraded
        };
        let message = if s.gave_up {
            Some(format!("gave up after {} reconnect attempts", s.reconnect_attempts))
        } else {
            s.message.clone()
        };
        Ok(SourceHealth {
            source_id: self.config.id.clone(),
            status,
            last_success: s.last_success,
            last_failure: s.last_failure,
            fail_count: s.fail_count,
            latency_ms: 0,
            message,
        })
    }
}

enum SessionEnd {
    Cancelled,
    Closed(String),
    Failed(String),
}

async fn connection_loop(
    source_id: String,
    settings: Arc<AlpacaStreamSettings>,
    shared: Arc<Mutex<StreamShared>>,
    cancel: CancellationToken,
) {
    loop {
        {
            let mut s = shared.lock();
            if !s.started {
                break;
            }
            s.state = ConnectionState::Connecting;
        }
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            r = connect_async(settings.url.as_str()) => r,
        };
        let reason = match connected {
            | Ok((ws, _)) => {
                shared.lock().state = ConnectionState::Connected;
                debug!(source_id = %source_id, "transport open, awaiting greeting");
                match run_session(ws, &source_id, &settings, &shared, &cancel).await {
                    | SessionEnd::Cancelled => break,
                    | SessionEnd::Closed(r) | SessionEnd::Failed(r) => r,
                }
            }
            | Err(e) => e.to_string(),
        };

        let delay = {
            let mut s = shared.lock();
            if !s.started || cancel.is_cancelled() {
                break;
            }
            s.fail_count = s.fail_count.saturating_add(1);
            s.authenticated = false;
            s.last_failure = Some(now_ms());
            s.message = Some(reason.clone());
            let limit = settings.max_reconnect_attempts;
            if limit != 0 && s.reconnect_attempts >= limit {
                s.gave_up = true;
                s.state = ConnectionState::Disconnected;
                warn!(source_id = %source_id, attempts = s.reconnect_attempts, "reconnect budget exhausted, giving up");
                return;
            }
            let delay = settings.reconnect_delay(s.reconnect_attempts);
            s.reconnect_attempts += 1;
            s.state = ConnectionState::Reconnecting;
            warn!(source_id = %source_id, reason = %reason, attempt = s.reconnect_attempts, delay_ms = delay.as_millis() as u64, "stream lost, reconnecting");
            delay
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    shared.lock().state = ConnectionState::Disconnected;
}

async fn run_session<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    source_id: &str,
    settings: &AlpacaStreamSettings,
    shared: &Mutex<StreamShared>,
    cancel: &CancellationToken,
) -> SessionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Cancelled;
            }
            msg = read.next() => msg,
        };
        let text = match msg {
            | None => return SessionEnd::Closed("stream ended".into()),
            | Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
            | Some(Ok(Message::Text(txt))) => txt,
            | Some(Ok(Message::Binary(bin))) => match String::from_utf8(bin) {
                | Ok(txt) => txt,
                | Err(_) => continue,
            },
            | Some(Ok(Message::Close(frame))) => {
                let why = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return SessionEnd::Closed(format!("closed by server {}", why).trim().to_string());
            }
            | Some(Ok(_)) => continue,
        };
        let replies = {
            let mut s = shared.lock();
            handle_payload(source_id, settings, &text, &mut s)
        };
        for reply in replies {
            if let Err(e) = write.send(Message::Text(reply)).await {
                return SessionEnd::Failed(e.to_string());
            }
        }
    }
}

/// Apply one server frame to the shared state. Returns frames to send back.
fn handle_payload(source_id: &str, settings: &AlpacaStreamSettings, text: &str, s: &mut StreamShared) -> Vec<String> {
    let items = match serde_json::from_str::<Value>(text) {
        | Ok(Value::Array(items)) => items,
        | Ok(single) => vec![single],
        | Err(e) => {
            debug!(source_id, error = %e, "ignoring non-json frame");
            return Vec::new();
        }
    };
    let mut replies = Vec::new();
    for item in items {
        match item.get("T").and_then(Value::as_str) {
            | Some("success") => match item.get("msg").and_then(Value::as_str) {
                | Some("connected") => {
                    s.state = ConnectionState::Connected;
                    replies.push(settings.auth_message());
                }
                | Some("authenticated") => {
                    s.state = ConnectionState::Authenticated;
                    s.authenticated = true;
                    s.fail_count = 0;
                    s.reconnect_attempts = 0;
                    s.last_success = now_ms();
                    s.message = None;
                    info!(source_id, "stream authenticated, subscribing");
                    replies.push(settings.subscribe_message());
                }
                | other => debug!(source_id, msg = ?other, "unhandled success message"),
            },
            | Some("error") => {
                let msg = item.get("msg").and_then(Value::as_str).unwrap_or("unknown error");
                let code = item.get("code").and_then(Value::as_i64).unwrap_or_default();
                warn!(source_id, code, msg, "stream error message");
                s.message = Some(format!("{} ({})", msg, code));
                s.last_failure = Some(now_ms());
            }
            | Some("subscription") => debug!(source_id, subscription = %item, "subscription confirmed"),
            | Some(kind) => {
                if let Some(tick) = message_to_tick(source_id, kind, &item) {
                    if s.buffer.len() >= settings.max_buffered_ticks {
                        s.buffer.pop_front();
                        s.dropped += 1;
                    }
                    s.buffer.push_back(tick);
                    s.last_success = now_ms();
                }
            }
            | None => debug!(source_id, "frame without type tag"),
        }
    }
    replies
}

#[derive(Deserialize)]
struct BarMsg {
    #[serde(rename = "S")]
    symbol: String,
    #[serde(rename = "t")]
    timestamp: String,
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

#[derive(Deserialize)]
struct TradeMsg {
    #[serde(rename = "S")]
    symbol: String,
    #[serde(rename = "t")]
    timestamp: String,
    p: f64,
    s: f64,
    #[serde(default)]
    x: Option<String>,
}

#[derive(Deserialize)]
struct QuoteMsg {
    #[serde(rename = "S")]
    symbol: String,
    #[serde(rename = "t")]
    timestamp: String,
    bp: f64,
    bs: f64,
    ap: f64,
    #[serde(rename = "as")]
    ask_size: f64,
}

fn message_to_tick(source_id: &str, kind: &str, item: &Value) -> Option<Tick> {
    let tick = match kind {
        | "b" | "u" | "d" => {
            let bar: BarMsg = serde_json::from_value(item.clone()).ok()?;
            let mut t = Tick::new(source_id, parse_timestamp_ms(&bar.timestamp)?)
                .with_symbol(bar.symbol)
                .with_metric("open", bar.o)
                .with_metric("high", bar.h)
                .with_metric("low", bar.l)
                .with_metric("close", bar.c)
                .with_metric("volume", bar.v)
                .with_metadata("type", json!("bar"));
            if let Some(n) = bar.n {
                t = t.with_metric("trade_count", n);
            }
            if let Some(vw) = bar.vw {
                t = t.with_metric("vwap", vw);
            }
            t
        }
        | "t" => {
            let trade: TradeMsg = serde_json::from_value(item.clone()).ok()?;
            let mut t = Tick::new(source_id, parse_timestamp_ms(&trade.timestamp)?)
                .with_symbol(trade.symbol)
                .with_metric("price", trade.p)
                .with_metric("size", trade.s)
                .with_metadata("type", json!("trade"));
            if let Some(x) = trade.x {
                t = t.with_metadata("exchange", json!(x));
            }
            t
        }
        | "q" => {
            let q: QuoteMsg = serde_json::from_value(item.clone()).ok()?;
            Tick::new(source_id, parse_timestamp_ms(&q.timestamp)?)
                .with_symbol(q.symbol)
                .with_metric("bid_price", q.bp)
                .with_metric("bid_size", q.bs)
                .with_metric("ask_price", q.ap)
                .with_metric("ask_size", q.ask_size)
                .with_metric("spread", q.ap - q.bp)
                .with_metadata("type", json!("quote"))
        }
        | _ => return None,
    };
    crate::ingest::normalize::normalize_tick(tick.with_metadata("raw_type", json!(kind)))
        .map(|mut t| {
            t.raw = Some(item.clone());
            t
        })
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::types::SourceKind;

    fn settings() -> AlpacaStreamSettings {
        let cfg = SourceConfig::new("alpaca", SourceKind::Streaming, "alpaca-stream")
            .with_setting("key_id", json!("KEY"))
            .with_setting("secret_key", json!("SECRET"))
            .with_setting("symbols", json!(["aapl", "msft"]))
            .with_setting("channels", json!(["bars", "trades"]));
        AlpacaStreamSettings::from_config(&cfg).unwrap()
    }

    fn started() -> StreamShared {
        StreamShared { started: true, ..Default::default() }
    }

    #[test]
    fn feed_selects_endpoint() {
        assert_eq!(feed_url("iex"), "wss://stream.data.alpaca.markets/v2/iex");
        assert_eq!(feed_url("sip"), "wss://stream.data.alpaca.markets/v2/sip");
        assert_eq!(feed_url("crypto"), "wss://stream.data.alpaca.markets/v1beta3/crypto/us");
        assert_eq!(settings().url, feed_url("iex"));
    }

    #[test]
    fn credentials_are_sent_only_after_greeting() {
        let cfg = settings();
        let mut s = started();
        let replies = handle_payload("alpaca", &cfg, r#"[{"T":"success","msg":"connected"}]"#, &mut s);
        assert_eq!(replies.len(), 1);
        let auth: Value = serde_json::from_str(&replies[0]).unwrap();
        assert_eq!(auth["action"], "auth");
        assert_eq!(auth["key"], "KEY");
        assert!(!s.authenticated);
    }

    #[test]
    fn authentication_resets_failures_and_subscribes() {
        let cfg = settings();
        let mut s = StreamShared { fail_count: 2, reconnect_attempts: 4, ..started() };
        let replies = handle_payload("alpaca", &cfg, r#"[{"T":"success","msg":"authenticated"}]"#, &mut s);
        assert!(s.authenticated);
        assert_eq!(s.fail_count, 0);
        assert_eq!(s.reconnect_attempts, 0);
        assert_eq!(s.state, ConnectionState::Authenticated);
        let sub: Value = serde_json::from_str(&replies[0]).unwrap();
        assert_eq!(sub["action"], "subscribe");
        assert_eq!(sub["bars"], json!(["AAPL", "MSFT"]));
        assert_eq!(sub["trades"], json!(["AAPL", "MSFT"]));
        assert!(sub.get("quotes").is_none());
    }

    #[test]
    fn domain_messages_become_ticks() {
        let cfg = settings();
        let mut s = started();
        let frame = r#"[
            {"T":"b","S":"AAPL","o":1,"h":2,"l":0.5,"c":1.5,"v":100,"t":"2024-02-01T15:06:40Z","n":5,"vw":1.2},
            {"T":"t","S":"MSFT","p":400.5,"s":10,"t":"2024-02-01T15:06:41Z","x":"V"},
            {"T":"q","S":"AAPL","bp":1.0,"bs":3,"ap":1.2,"as":4,"t":"2024-02-01T15:06:42Z"},
            {"T":"b","S":"AAPL","t":"not a time","o":1,"h":1,"l":1,"c":1,"v":1}
        ]"#;
        assert!(handle_payload("alpaca", &cfg, frame, &mut s).is_empty());
        assert_eq!(s.buffer.len(), 3);
        let bar = &s.buffer[0];
        assert_eq!(bar.timestamp, 1_706_800_000_000);
        assert_eq!(bar.metrics["close"], 1.5);
        assert_eq!(bar.metrics["vwap"], 1.2);
        assert_eq!(s.buffer[1].metrics["price"], 400.5);
        assert!((s.buffer[2].metrics["spread"] - 0.2).abs() < 1e-9);
    }

    #[test]
    fn buffer_is_bounded_dropping_oldest() {
        let mut cfg = settings();
        cfg.max_buffered_ticks = 2;
        let mut s = started();
        for i in 0..3 {
            let frame = format!(r#"{{"T":"t","S":"AAPL","p":{},"s":1,"t":"2024-02-01T15:06:4{}Z"}}"#, 100 + i, i);
            handle_payload("alpaca", &cfg, &frame, &mut s);
        }
        assert_eq!(s.buffer.len(), 2);
        assert_eq!(s.dropped, 1);
        assert_eq!(s.buffer[0].metrics["price"], 101.0);
    }

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        let mut cfg = settings();
        cfg.reconnect_base_ms = 100;
        cfg.max_reconnect_delay_ms = 500;
        assert_eq!(cfg.reconnect_delay(0), Duration::from_millis(100));
        assert_eq!(cfg.reconnect_delay(1), Duration::from_millis(200));
        assert_eq!(cfg.reconnect_delay(2), Duration::from_millis(400));
        assert_eq!(cfg.reconnect_delay(3), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn fetch_drains_without_duplicates() {
        let cfg = SourceConfig::new("alpaca", SourceKind::Streaming, "alpaca-stream")
            .with_setting("key_id", json!("KEY"))
            .with_setting("secret_key", json!("SECRET"))
            .with_setting("symbols", json!(["AAPL"]));
        let src = AlpacaStreamSource::new(cfg).unwrap();
        {
            let mut s = src.shared.lock();
            s.started = true;
            handle_payload("alpaca", &src.settings, r#"{"T":"t","S":"AAPL","p":1,"s":1,"t":"2024-02-01T15:06:40Z"}"#, &mut s);
        }
        assert_eq!(src.fetch().await.unwrap().len(), 1);
        assert!(src.fetch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn health_follows_connection_state() {
        let cfg = SourceConfig::new("alpaca", SourceKind::Streaming, "alpaca-stream")
            .with_setting("key_id", json!("KEY"))
            .with_setting("secret_key", json!("SECRET"))
            .with_setting("symbols", json!(["AAPL"]));
        let src = AlpacaStreamSource::new(cfg).unwrap();
        assert_eq!(src.health_check().await.unwrap().status, SourceHealthStatus::Offline);
        src.shared.lock().started = true;
        assert_eq!(src.health_check().await.unwrap().status, SourceHealthStatus::Degraded);
        src.shared.lock().authenticated = true;
        assert_eq!(src.health_check().await.unwrap().status, SourceHealthStatus::Healthy);
        {
            let mut s = src.shared.lock();
            s.authenticated = false;
            s.fail_count = 3;
        }
        assert_eq!(src.health_check().await.unwrap().status, SourceHealthStatus::Offline);
    }

    #[test]
    fn missing_symbols_or_bad_channel_is_config_error() {
        let base = SourceConfig::new("alpaca", SourceKind::Streaming, "alpaca-stream")
            .with_setting("key_id", json!("KEY"))
            .with_setting("secret_key", json!("SECRET"));
        assert!(AlpacaStreamSettings::from_config(&base).is_err());
        let bad = base.with_setting("symbols", json!(["AAPL"])).with_setting("channels", json!(["news"]));
        assert!(AlpacaStreamSettings::from_config(&bad).is_err());
    }
}
