//! # tickscope
//! Market-data ingestion and model-driven anomaly detection.
//!
//! Sources are polled on a schedule into a batch buffer. Each flushed
//! batch is pre-screened statistically and handed to a language model
//! (behind a fallback chain of providers) that reports anomalies, which
//! are published on a typed event bus.

pub use crate::utils::error::{Error, Result};

pub mod analysis;
pub mod config;
pub mod events;
pub mod ingest;
pub mod llm;
pub mod metrics;
pub mod monitor;
pub mod pipeline;
pub mod sources;
pub mod utils;

pub use crate::config::Config;
pub use crate::events::{EventBus, PipelineEvent};
pub use crate::pipeline::Pipeline;
