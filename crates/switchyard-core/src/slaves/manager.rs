//! SlavePoolManager: owns every slave pool.
//!
//! Pools are created from a static [`SlaveRegistry`] and the per-pool
//! settings in [`SwitchyardConfig`]. The manager also runs a monitor loop
//! refreshing size/capacity gauges and a health checker whose remediation
//! replaces unhealthy slaves.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::pool::{PoolStatus, SlavePool};
use super::{Slave, SlaveFactory};
use crate::config::SwitchyardConfig;
use crate::error::{OrchestratorError, SlaveError};
use crate::health::{HealthChecker, HealthProbe, ProbeStatus};
use crate::metrics::ManagerMetrics;
use crate::models::{Domain, SlaveType};
use crate::store::DynStore;

// ─── Registry ──────────────────────────────────────────────────────────────

/// Static map from `(domain, slave_type)` to the factory building its slaves.
#[derive(Clone, Default)]
pub struct SlaveRegistry {
    factories: HashMap<(Domain, SlaveType), SlaveFactory>,
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, slave_type: SlaveType, factory: SlaveFactory) -> &mut Self {
        self.factories.insert((slave_type.domain(), slave_type), factory);
        self
    }

    pub fn register_fn<F>(&mut self, slave_type: SlaveType, factory: F) -> &mut Self
    where
        F: Fn() -> Result<Arc<dyn Slave>, SlaveError> + Send + Sync + 'static,
    {
        self.register(slave_type, Arc::new(factory))
    }

    pub fn get(&self, domain: Domain, slave_type: SlaveType) -> Option<SlaveFactory> {
        self.factories.get(&(domain, slave_type)).cloned()
    }

    pub fn contains(&self, domain: Domain, slave_type: SlaveType) -> bool {
        self.factories.contains_key(&(domain, slave_type))
    }
}

// ─── Health probe ──────────────────────────────────────────────────────────

struct PoolProbe {
    name: String,
    pool: Arc<SlavePool>,
}

#[async_trait]
impl HealthProbe for PoolProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<(), String> {
        let unhealthy = self.pool.unhealthy_count();
        if unhealthy == 0 {
            Ok(())
        } else {
            Err(format!("{} of {} slave(s) unhealthy", unhealthy, self.pool.size()))
        }
    }

    async fn remediate(&self) {
        self.pool.replace_unhealthy();
    }
}

fn probe_name(domain: Domain, slave_type: SlaveType) -> String {
    format!("pool:{}", SwitchyardConfig::pool_key(domain, slave_type))
}

// ─── Manager ───────────────────────────────────────────────────────────────

pub struct SlavePoolManager {
    store: DynStore,
    registry: SlaveRegistry,
    config: Arc<SwitchyardConfig>,
    pools: RwLock<HashMap<(Domain, SlaveType), Arc<SlavePool>>>,
    metrics: ManagerMetrics,
    health: HealthChecker,
    background_started: AtomicBool,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SlavePoolManager {
    pub fn new(
        store: DynStore,
        registry: SlaveRegistry,
        config: Arc<SwitchyardConfig>,
    ) -> Result<Arc<Self>, OrchestratorError> {
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            store,
            registry,
            config,
            pools: RwLock::new(HashMap::new()),
            metrics: ManagerMetrics::new()?,
            health: HealthChecker::new(),
            background_started: AtomicBool::new(false),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }))
    }

    pub fn metrics(&self) -> &ManagerMetrics {
        &self.metrics
    }

    pub fn health_checker(&self) -> &HealthChecker {
        &self.health
    }

    /// Start pools for the given domains and slave types (all when `None`).
    /// Types with no registered factory are skipped with a warning; pools
    /// that already run are left alone. Returns the number of pools started.
    pub async fn start_pools(
        self: &Arc<Self>,
        domains: Option<&[Domain]>,
        slave_types: Option<&[SlaveType]>,
    ) -> Result<usize, OrchestratorError> {
        let domains = domains.unwrap_or(&Domain::PIPELINE);
        let mut started = 0;

        for &domain in domains {
            for &slave_type in domain.slave_types() {
                if let Some(filter) = slave_types {
                    if !filter.contains(&slave_type) {
                        continue;
                    }
                }
                // Held until the pool is inserted so concurrent callers
                // cannot start a second pool on the same task channel.
                let mut pools = self.pools.write().await;
                if pools.contains_key(&(domain, slave_type)) {
                    continue;
                }
                let Some(factory) = self.registry.get(domain, slave_type) else {
                    tracing::warn!("[PoolManager] No slave registered for {}/{}", domain, slave_type);
                    continue;
                };

                let pool = SlavePool::new(
                    domain,
                    slave_type,
                    self.config.pool(domain, slave_type),
                    factory,
                    Arc::clone(&self.store),
                    self.config.load_balancing,
                    self.config.timing.autoscale_interval(),
                    self.config.timing.intake_retry(),
                )?;
                pool.start().await?;
                pools.insert((domain, slave_type), Arc::clone(&pool));
                drop(pools);
                self.health
                    .register(Arc::new(PoolProbe {
                        name: probe_name(domain, slave_type),
                        pool,
                    }))
                    .await;
                started += 1;
            }
        }

        self.refresh_gauges().await;
        self.start_background().await;
        tracing::info!("[PoolManager] Started {} pool(s)", started);
        Ok(started)
    }

    async fn start_background(self: &Arc<Self>) {
        if self.background_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(false);

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.timing.monitor_interval();
        let monitor = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => manager.refresh_gauges().await,
                }
            }
        });
        let health = self
            .health
            .spawn(self.config.timing.health_check_interval(), self.shutdown.subscribe());
        self.handles.lock().await.extend([monitor, health]);
    }

    /// Stop every pool and the background loops.
    pub async fn stop_all_pools(&self) {
        let pools: Vec<((Domain, SlaveType), Arc<SlavePool>)> = self.pools.write().await.drain().collect();
        for ((domain, slave_type), pool) in pools {
            pool.stop().await;
            self.health.unregister(&probe_name(domain, slave_type)).await;
        }

        if self.background_started.swap(false, Ordering::SeqCst) {
            self.shutdown.send_replace(true);
            let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
            for handle in handles {
                let _ = handle.await;
            }
        }
        self.refresh_gauges().await;
        tracing::info!("[PoolManager] All pools stopped");
    }

    /// Stop the pools of one domain. Returns how many were stopped.
    pub async fn stop_domain_pools(&self, domain: Domain) -> usize {
        let removed: Vec<((Domain, SlaveType), Arc<SlavePool>)> = {
            let mut pools = self.pools.write().await;
            let keys: Vec<(Domain, SlaveType)> = pools.keys().filter(|(d, _)| *d == domain).copied().collect();
            keys.into_iter()
                .filter_map(|key| pools.remove(&key).map(|pool| (key, pool)))
                .collect()
        };
        for ((d, slave_type), pool) in &removed {
            pool.stop().await;
            self.health.unregister(&probe_name(*d, *slave_type)).await;
        }
        self.refresh_gauges().await;
        tracing::info!("[PoolManager] Stopped {} pool(s) for domain {}", removed.len(), domain);
        removed.len()
    }

    pub async fn get_pool(&self, domain: Domain, slave_type: SlaveType) -> Option<Arc<SlavePool>> {
        self.pools.read().await.get(&(domain, slave_type)).cloned()
    }

    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }

    /// Status of every pool keyed by `"{domain}.{slave_type}"`.
    pub async fn get_status(&self) -> BTreeMap<String, PoolStatus> {
        self.pools
            .read()
            .await
            .iter()
            .map(|((domain, slave_type), pool)| (SwitchyardConfig::pool_key(*domain, *slave_type), pool.get_status()))
            .collect()
    }

    /// Per domain: healthy when any of its pools is.
    pub async fn get_health(&self) -> BTreeMap<Domain, bool> {
        let mut health: BTreeMap<Domain, bool> = BTreeMap::new();
        for ((domain, _), pool) in self.pools.read().await.iter() {
            let entry = health.entry(*domain).or_insert(false);
            *entry = *entry || pool.get_health();
        }
        health
    }

    /// Latest health-checker results for every pool probe.
    pub async fn probe_statuses(&self) -> HashMap<String, ProbeStatus> {
        self.health.snapshot().await
    }

    pub async fn scale_pool(
        &self,
        domain: Domain,
        slave_type: SlaveType,
        target: usize,
    ) -> Result<usize, OrchestratorError> {
        let pool = self
            .get_pool(domain, slave_type)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("pool {}/{}", domain, slave_type)))?;
        let size = pool.scale_to(target)?;
        self.refresh_gauges().await;
        Ok(size)
    }

    async fn refresh_gauges(&self) {
        let pools = self.pools.read().await;
        self.metrics.pool_size.reset();
        self.metrics.pool_capacity.reset();
        for ((domain, slave_type), pool) in pools.iter() {
            let labels = [domain.as_str(), slave_type.as_str()];
            self.metrics.pool_size.with_label_values(&labels).set(pool.size() as i64);
            self.metrics
                .pool_capacity
                .with_label_values(&labels)
                .set(pool.max_size() as i64);
        }
    }
}
