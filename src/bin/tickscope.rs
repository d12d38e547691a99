//! tickscope command-line entrypoint

use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tickscope::config::Config;
use tickscope::ingest::{normalize_all, pre_screen};
use tickscope::sources::factory::CSV_FILE;
use tickscope::sources::{create_source, Source};
use tickscope::utils::types::{SourceConfig, SourceKind};
use tickscope::utils::init_logging;
use tickscope::Pipeline;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "tickscope", author, version, about = "Market-data anomaly detection pipeline", long_about = None)]
struct Args {
    /// Log level used when neither TICKSCOPE_LOG nor RUST_LOG is set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the pipeline until Ctrl-C
    Run {
        /// Path to the configuration file (TOML)
        #[arg(short, long, default_value = "tickscope.toml")]
        config: PathBuf,
        /// Record Prometheus metrics and print them on shutdown
        #[arg(long)]
        metrics: bool,
        /// Serve /healthz, /health and /metrics on this address
        #[arg(long, value_name = "ADDR")]
        listen: Option<SocketAddr>,
    },
    /// Print the commented default configuration
    PrintDefaultConfig,
    /// Start the configured sources once and print their health as JSON
    Health {
        #[arg(short, long, default_value = "tickscope.toml")]
        config: PathBuf,
    },
    /// Pre-screen a CSV file offline and print scored ticks as JSON lines
    Screen {
        #[arg(long, value_name = "CSV")]
        data: PathBuf,
        /// Symbol for files without a symbol column
        #[arg(long)]
        symbol: Option<String>,
        /// Take pre-screen thresholds from this configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    match args.command {
        | Command::PrintDefaultConfig => {
            print!("{}", Config::default_toml());
            Ok(())
        }
        | Command::Run { config, metrics, listen } => {
            let config = Config::load(&config).with_context(|| format!("failed to load {}", config.display()))?;
            run(config, metrics, listen).await
        }
        | Command::Health { config } => {
            let config = Config::load(&config).with_context(|| format!("failed to load {}", config.display()))?;
            health(config).await
        }
        | Command::Screen { data, symbol, config } => {
            let config = match config {
                | Some(path) => Config::load(&path).with_context(|| format!("failed to load {}", path.display()))?,
                | None => Config::default(),
            };
            screen(&config, data, symbol).await
        }
    }
}

async fn run(config: Config, metrics: bool, listen: Option<SocketAddr>) -> Result<()> {
    let metrics = metrics || config.metrics.enabled || listen.is_some();
    if metrics {
        tickscope::metrics::init()?;
    }

    let pipeline = Arc::new(Pipeline::from_config(&config).context("failed to build pipeline")?);
    pipeline.start().await.context("failed to start pipeline")?;

    let server = match listen {
        | Some(addr) => Some(serve(addr, pipeline.clone()).await?),
        | None => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Stopping...");
    if let Some(server) = server {
        server.abort();
    }
    pipeline.stop().await;

    if metrics {
        print!("{}", tickscope::metrics::render());
    }
    Ok(())
}

async fn serve(addr: SocketAddr, pipeline: Arc<Pipeline>) -> Result<tokio::task::JoinHandle<()>> {
    async fn healthz() -> impl IntoResponse {
        "OK"
    }

    async fn health_handler(State(pipeline): State<Arc<Pipeline>>) -> impl IntoResponse {
        Json(pipeline.health().await)
    }

    async fn metrics_handler() -> impl IntoResponse {
        tickscope::metrics::render()
    }

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(pipeline);

    let server = axum::Server::try_bind(&addr)
        .with_context(|| format!("failed to bind {}", addr))?
        .serve(app.into_make_service());
    info!("Serving /healthz, /health and /metrics on http://{}", server.local_addr());
    Ok(tokio::spawn(async move {
        if let Err(e) = server.await {
            warn!("http server exited: {}", e);
        }
    }))
}

async fn health(config: Config) -> Result<()> {
    let mut config = config;
    config.monitor.enabled = false;
    let pipeline = Pipeline::from_config(&config)?;
    for (id, e) in pipeline.registry().start_all().await {
        warn!(source_id = %id, error = %e, "source failed to start");
    }
    let health = pipeline.health().await;
    println!("{}", serde_json::to_string_pretty(&health)?);
    pipeline.stop().await;
    Ok(())
}

async fn screen(config: &Config, data: PathBuf, symbol: Option<String>) -> Result<()> {
    let mut source_cfg = SourceConfig::new("screen", SourceKind::File, CSV_FILE)
        .with_setting("path", serde_json::json!(data.display().to_string()));
    if let Some(symbol) = symbol {
        source_cfg = source_cfg.with_setting("symbol", serde_json::json!(symbol));
    }
    let source = create_source(source_cfg)?;
    source.start().await?;
    let ticks = normalize_all(source.fetch().await?);
    source.stop().await?;

    for scored in pre_screen(&ticks, &config.prescreen) {
        println!("{}", serde_json::to_string(&scored)?);
    }
    Ok(())
}
