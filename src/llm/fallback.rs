//! Ordered provider chain that presents several providers as one.
//!
//! Each attempt is drained completely before anything reaches the caller, so
//! a provider that dies mid-stream never leaks partial output.

use super::{CreateMessageParams, EventStream, LlmProvider, ProviderHealth, StreamEvent};
use crate::utils::error::ProviderFailure;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const FALLBACK_ID: &str = "fallback";

#[derive(Clone)]
struct ChainEntry {
    provider: Arc<dyn LlmProvider>,
    timeout: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct FallbackProvider {
    chain: Vec<ChainEntry>,
}

impl FallbackProvider {
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        Self { chain: providers.into_iter().map(|provider| ChainEntry { provider, timeout: None }).collect() }
    }

    /// Append a provider whose whole attempt (request plus stream) is bounded
    /// by `timeout`.
    pub fn push(&mut self, provider: Arc<dyn LlmProvider>, timeout: Option<Duration>) {
        self.chain.push(ChainEntry { provider, timeout });
    }

    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>, timeout: Option<Duration>) -> Self {
        self.push(provider, timeout);
        self
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.chain.iter().map(|e| e.provider.id().to_string()).collect()
    }

    async fn drain(provider: &dyn LlmProvider, params: &CreateMessageParams) -> Result<Vec<StreamEvent>> {
        let mut stream = provider.create_message(params).await?;
        let mut events = Vec::new();
        while let Some(item) = stream.next().await {
            events.push(item?);
        }
        Ok(events)
    }

    async fn attempt(entry: &ChainEntry, params: &CreateMessageParams) -> Result<Vec<StreamEvent>> {
        let run = Self::drain(entry.provider.as_ref(), params);
        match entry.timeout {
            | Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| Error::provider(entry.provider.id(), format!("timed out after {:?}", limit)))?,
            | None => run.await,
        }
    }
}

#[async_trait]
impl LlmProvider for FallbackProvider {
    fn id(&self) -> &str {
        FALLBACK_ID
    }

    async fn create_message(&self, params: &CreateMessageParams) -> Result<EventStream> {
        let mut failures = Vec::new();
        for entry in &self.chain {
            let provider_id = entry.provider.id().to_string();
            match Self::attempt(entry, params).await {
                | Ok(events) => {
                    if !failures.is_empty() {
                        info!(provider = %provider_id, skipped = failures.len(), "fallback provider succeeded");
                    }
                    return Ok(stream::iter(events.into_iter().map(Ok)).boxed());
                }
                | Err(e) => {
                    warn!(provider = %provider_id, error = %e, "provider attempt failed");
                    metrics::counter!("tickscope_provider_failures_total", 1, "provider" => provider_id.clone());
                    let message = match e {
                        | Error::Provider { message, .. } => message,
                        | other => other.to_string(),
                    };
                    failures.push(ProviderFailure { provider_id, message });
                }
            }
        }
        Err(Error::AllProvidersFailed(failures))
    }

    async fn health_check(&self) -> ProviderHealth {
        let mut errors = Vec::new();
        for entry in &self.chain {
            let health = entry.provider.health_check().await;
            if health.is_usable() {
                return health;
            }
            errors.push(format!(
                "{}: {}",
                health.provider_id,
                health.last_error.unwrap_or_else(|| format!("{:?}", health.status))
            ));
        }
        let message = if errors.is_empty() { "no providers configured".to_string() } else { errors.join("; ") };
        ProviderHealth::offline(FALLBACK_ID, message)
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let mut models: Vec<String> = Vec::new();
        for entry in &self.chain {
            match entry.provider.list_models().await {
                | Ok(list) => {
                    for m in list {
                        if !models.contains(&m) {
                            models.push(m);
                        }
                    }
                }
                | Err(e) => warn!(provider = %entry.provider.id(), error = %e, "list_models failed"),
            }
        }
        Ok(models)
    }
}
