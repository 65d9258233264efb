//! Periodic health probing with remediation hooks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

/// Something whose health can be checked. `remediate` runs after a failed
/// check; the default does nothing.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<(), String>;

    async fn remediate(&self) {}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeStatus {
    pub healthy: bool,
    pub last_checked: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub consecutive_failures: u32,
}

struct HealthCheckerInner {
    probes: Vec<Arc<dyn HealthProbe>>,
    statuses: HashMap<String, ProbeStatus>,
}

#[derive(Clone)]
pub struct HealthChecker {
    inner: Arc<RwLock<HealthCheckerInner>>,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HealthCheckerInner {
                probes: Vec::new(),
                statuses: HashMap::new(),
            })),
        }
    }

    /// Register a probe, replacing any existing probe with the same name.
    pub async fn register(&self, probe: Arc<dyn HealthProbe>) {
        let mut inner = self.inner.write().await;
        let name = probe.name().to_string();
        inner.probes.retain(|p| p.name() != name);
        inner.probes.push(probe);
    }

    pub async fn unregister(&self, name: &str) {
        let mut inner = self.inner.write().await;
        inner.probes.retain(|p| p.name() != name);
        inner.statuses.remove(name);
    }

    /// Run every probe once. Failing probes are remediated before returning.
    pub async fn check_all(&self) -> HashMap<String, ProbeStatus> {
        let probes: Vec<Arc<dyn HealthProbe>> = self.inner.read().await.probes.clone();

        let mut results = Vec::with_capacity(probes.len());
        for probe in &probes {
            let outcome = probe.check().await;
            if let Err(reason) = &outcome {
                tracing::warn!("[HealthChecker] {} unhealthy: {}", probe.name(), reason);
                probe.remediate().await;
            }
            results.push((probe.name().to_string(), outcome));
        }

        let mut inner = self.inner.write().await;
        for (name, outcome) in results {
            let previous_failures = inner
                .statuses
                .get(&name)
                .map(|s| s.consecutive_failures)
                .unwrap_or(0);
            let status = match outcome {
                Ok(()) => ProbeStatus {
                    healthy: true,
                    last_checked: Utc::now(),
                    error: None,
                    consecutive_failures: 0,
                },
                Err(reason) => ProbeStatus {
                    healthy: false,
                    last_checked: Utc::now(),
                    error: Some(reason),
                    consecutive_failures: previous_failures + 1,
                },
            };
            inner.statuses.insert(name, status);
        }
        inner.statuses.clone()
    }

    /// `None` when the probe has never been checked.
    pub async fn is_healthy(&self, name: &str) -> Option<bool> {
        self.inner.read().await.statuses.get(name).map(|s| s.healthy)
    }

    pub async fn snapshot(&self) -> HashMap<String, ProbeStatus> {
        self.inner.read().await.statuses.clone()
    }

    /// Check every `interval` until `shutdown` flips to `true`.
    pub fn spawn(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let checker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        checker.check_all().await;
                    }
                }
            }
        })
    }
}
