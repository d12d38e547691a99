//! Delimited-file source. Each `fetch` re-reads the file and returns only
//! rows appended since the previous successful read.

use super::{HealthTracker, Source};
use crate::utils::time::parse_timestamp_ms;
use crate::utils::types::{SourceConfig, SourceHealth, Tick};
use crate::{Error, Result};
use async_trait::async_trait;
use csv::{ReaderBuilder, StringRecord};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Which header names feed which tick fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvColumns {
    pub timestamp: String,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub symbol: Option<String>,
}

impl Default for CsvColumns {
    fn default() -> Self {
        Self {
            timestamp: "timestamp".into(),
            open: "open".into(),
            high: "high".into(),
            low: "low".into(),
            close: "close".into(),
            volume: "volume".into(),
            symbol: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CsvFileSettings {
    pub path: PathBuf,
    pub symbol: Option<String>,
    pub delimiter: u8,
    pub columns: CsvColumns,
}

impl CsvFileSettings {
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        let path = config
            .setting_str("path")
            .ok_or_else(|| Error::ConfigError(format!("source {}: csv-file requires `path`", config.id)))?;
        let delimiter = match config.setting_str("delimiter") {
            | Some(d) if d == "\\t" || d == "tab" => b'\t',
            | Some(d) if d.len() == 1 => d.as_bytes()[0],
            | Some(d) => {
                return Err(Error::ConfigError(format!("source {}: invalid delimiter {:?}", config.id, d)))
            }
            | None => b',',
        };
        let columns = match config.settings.get("columns") {
            | Some(v) => serde_json::from_value(v.clone())?,
            | None => CsvColumns::default(),
        };
        Ok(Self {
            path: PathBuf::from(path),
            symbol: config.setting_str("symbol").map(String::from),
            delimiter,
            columns,
        })
    }
}

pub struct CsvFileSource {
    config: SourceConfig,
    settings: CsvFileSettings,
    rows_consumed: Mutex<usize>,
    running: AtomicBool,
    health: HealthTracker,
}

impl CsvFileSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let settings = CsvFileSettings::from_config(&config)?;
        Ok(Self {
            config,
            settings,
            rows_consumed: Mutex::new(0),
            running: AtomicBool::new(false),
            health: HealthTracker::default(),
        })
    }

    pub fn settings(&self) -> &CsvFileSettings {
        &self.settings
    }

    fn read_new_rows(&self) -> Result<Vec<Tick>> {
        let content = std::fs::read_to_string(&self.settings.path)?;
        // A trailing line without a newline may still be mid-write.
        let complete = match content.rfind('\n') {
            | Some(i) => &content[..=i],
            | None => "",
        };
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .delimiter(self.settings.delimiter)
            .from_reader(complete.as_bytes());
        let headers = rdr.headers()?.clone();
        let layout = ColumnLayout::resolve(&headers, &self.settings.columns)
            .ok_or_else(|| Error::DataError(format!(
                "{}: no `{}` column", self.settings.path.display(), self.settings.columns.timestamp
            )))?;

        let mut consumed = self.rows_consumed.lock();
        let records: Vec<_> = rdr.records().collect();
        if records.len() < *consumed {
            info!(source_id = %self.config.id, "file shrank, re-reading from the start");
            *consumed = 0;
        }
        let mut ticks = Vec::new();
        for (row, record) in records.iter().enumerate().skip(*consumed) {
            match record {
                | Ok(record) => match self.row_to_tick(&layout, record, row) {
                    | Some(t) => ticks.push(t),
                    | None => debug!(source_id = %self.config.id, row, "skipping malformed row"),
                },
                | Err(e) => debug!(source_id = %self.config.id, row, error = %e, "skipping unreadable row"),
            }
        }
        *consumed = records.len();
        Ok(ticks)
    }

    fn row_to_tick(&self, layout: &ColumnLayout, record: &StringRecord, row: usize) -> Option<Tick> {
        let timestamp = parse_timestamp_ms(record.get(layout.timestamp)?)?;
        let mut tick = Tick::new(&self.config.id, timestamp);
        for (name, idx) in &layout.metrics {
            if let Some(v) = record.get(*idx).and_then(|s| s.trim().parse::<f64>().ok()) {
                if v.is_finite() {
                    tick.metrics.insert((*name).to_string(), v);
                }
            }
        }
        if tick.metrics.is_empty() {
            return None;
        }
        let symbol = layout
            .symbol
            .and_then(|i| record.get(i))
            .map(str::to_string)
            .or_else(|| self.settings.symbol.clone());
        tick.symbol = symbol;
        tick.metadata.insert("row".into(), serde_json::json!(row));
        tick.metadata.insert("file".into(), serde_json::json!(self.settings.path.display().to_string()));
        Some(tick)
    }
}

struct ColumnLayout {
    timestamp: usize,
    symbol: Option<usize>,
    metrics: Vec<(&'static str, usize)>,
}

impl ColumnLayout {
    fn resolve(headers: &StringRecord, columns: &CsvColumns) -> Option<Self> {
        let find = |name: &str| headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name.trim()));
        let timestamp = find(columns.timestamp.as_str())?;
        let metrics = [
            ("open", &columns.open),
            ("high", &columns.high),
            ("low", &columns.low),
            ("close", &columns.close),
            ("volume", &columns.volume),
        ]
        .into_iter()
        .filter_map(|(metric, header)| find(header.as_str()).map(|i| (metric, i)))
        .collect();
        let symbol = columns.symbol.as_deref().and_then(find);
        Some(Self { timestamp, symbol, metrics })
    }
}

#[async_trait]
impl Source for CsvFileSource {
    fn config(&self) -> &SourceConfig {
        &self.config
    }

    async fn start(&self) -> Result<()> {
        if !path_exists(&self.settings.path) {
            return Err(Error::DataError(format!("{} does not exist", self.settings.path.display())));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<Tick>> {
        let started = Instant::now();
        match self.read_new_rows() {
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

fn path_exists(path: &Path) -> bool {
    path.try_exists().unwrap_or(false)
}
