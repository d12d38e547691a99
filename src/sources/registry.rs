//! Registry of named sources with fan-out lifecycle and health queries.

use super::Source;
use crate::utils::types::SourceHealth;
use crate::{Error, Result};
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

/// Holds sources in registration order. Ids are unique.
#[derive(Default)]
pub struct SourceRegistry {
    sources: RwLock<Vec<Arc<dyn Source>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source: Arc<dyn Source>) -> Result<()> {
        let mut sources = self.sources.write();
        if sources.iter().any(|s| s.id() == source.id()) {
            return Err(Error::DuplicateSource(source.id().to_string()));
        }
        info!(source_id = source.id(), plugin = %source.config().plugin_id, "source registered");
        sources.push(source);
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> Result<Arc<dyn Source>> {
        let mut sources = self.sources.write();
        let pos = sources
            .iter()
            .position(|s| s.id() == id)
            .ok_or_else(|| Error::UnknownSource(id.to_string()))?;
        Ok(sources.remove(pos))
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Source>> {
        self.sources
            .read()
            .iter()
            .find(|s| s.id() == id)
            .cloned()
            .ok_or_else(|| Error::UnknownSource(id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        self.sources.read().iter().map(|s| s.id().to_string()).collect()
    }

    pub fn list(&self) -> Vec<Arc<dyn Source>> {
        self.sources.read().clone()
    }

    pub fn enabled(&self) -> Vec<Arc<dyn Source>> {
        self.sources.read().iter().filter(|s| s.config().enabled).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start every enabled source concurrently. One source failing to start
    /// does not stop the others; failures are returned per source id.
    pub async fn start_all(&self) -> Vec<(String, Error)> {
        let sources = self.enabled();
        let results = join_all(sources.iter().map(|s| s.start())).await;
        sources
            .iter()
            .zip(results)
            .filter_map(|(s, r)| match r {
                | Ok(()) => None,
                | Err(e) => {
                    warn!(source_id = s.id(), error = %e, "source failed to start");
                    Some((s.id().to_string(), e))
                }
            })
            .collect()
    }

    pub async fn stop_all(&self) {
        let sources = self.list();
        let results = join_all(sources.iter().map(|s| s.stop())).await;
        for (s, r) in sources.iter().zip(results) {
            if let Err(e) = r {
                warn!(source_id = s.id(), error = %e, "source failed to stop cleanly");
            }
        }
    }

    /// Health of every registered source. A failing health check becomes an
    /// offline record carrying the error message.
    pub async fn health_check_all(&self) -> Vec<SourceHealth> {
        let sources = self.list();
        let results = join_all(sources.iter().map(|s| s.health_check())).await;
        sources
            .iter()
            .zip(results)
            .map(|(s, r)| r.unwrap_or_else(|e| SourceHealth::offline(s.id(), e.to_string())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::types::{SourceConfig, SourceHealthStatus, SourceKind, Tick};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubSource {
        config: SourceConfig,
        running: AtomicBool,
        fail_start: bool,
        fail_health: bool,
    }

    impl StubSource {
        fn new(id: &str) -> Self {
            Self {
                config: SourceConfig::new(id, SourceKind::Polling, "stub"),
                running: AtomicBool::new(false),
                fail_start: false,
                fail_health: false,
            }
        }
    }

    #[async_trait]
    impl Source for StubSource {
        fn config(&self) -> &SourceConfig {
            &self.config
        }
        async fn start(&self) -> Result<()> {
            if self.fail_start {
                return Err(Error::ConnectionError("refused".into()));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
        async fn fetch(&self) -> Result<Vec<Tick>> {
            Ok(Vec::new())
        }
        async fn health_check(&self) -> Result<SourceHealth> {
            if self.fail_health {
                return Err(Error::Other("probe exploded".into()));
            }
            let mut h = SourceHealth::offline(self.id(), "");
            h.status = SourceHealthStatus::Healthy;
            Ok(h)
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let reg = SourceRegistry::new();
        reg.register(Arc::new(StubSource::new("a"))).unwrap();
        assert_matches!(reg.register(Arc::new(StubSource::new("a"))), Err(Error::DuplicateSource(id)) if id == "a");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn unknown_ids_fail_loudly() {
        let reg = SourceRegistry::new();
        assert_matches!(reg.get("nope").map(|_| ()), Err(Error::UnknownSource(_)));
        assert_matches!(reg.unregister("nope").map(|_| ()), Err(Error::UnknownSource(_)));
    }

    #[test]
    fn registration_order_is_kept() {
        let reg = SourceRegistry::new();
        for id in ["c", "a", "b"] {
            reg.register(Arc::new(StubSource::new(id))).unwrap();
        }
        assert_eq!(reg.ids(), vec!["c", "a", "b"]);
        reg.unregister("a").unwrap();
        assert_eq!(reg.ids(), vec!["c", "b"]);
    }

    #[tokio::test]
    async fn start_failures_are_isolated() {
        let reg = SourceRegistry::new();
        let good = Arc::new(StubSource::new("good"));
        let mut bad = StubSource::new("bad");
        bad.fail_start = true;
        reg.register(good.clone()).unwrap();
        reg.register(Arc::new(bad)).unwrap();

        let failures = reg.start_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "bad");
        assert!(good.running.load(Ordering::SeqCst));

        reg.stop_all().await;
        assert!(!good.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failing_health_check_becomes_offline_record() {
        let reg = SourceRegistry::new();
        let mut broken = StubSource::new("broken");
        broken.fail_health = true;
        reg.register(Arc::new(StubSource::new("ok"))).unwrap();
        reg.register(Arc::new(broken)).unwrap();

        let health = reg.health_check_all().await;
        assert_eq!(health[0].status, SourceHealthStatus::Healthy);
        assert_eq!(health[1].status, SourceHealthStatus::Offline);
        assert!(health[1].message.as_deref().unwrap().contains("probe exploded"));
    }
}
