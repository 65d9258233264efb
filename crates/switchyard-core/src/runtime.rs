//! In-process wiring of every component into one start/stop unit.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::config::SwitchyardConfig;
use crate::error::OrchestratorError;
use crate::master::global::{GlobalHealth, GlobalMaster};
use crate::master::{domain_logic, DomainMaster, MasterHealth};
use crate::models::Domain;
use crate::slaves::{SlavePoolManager, SlaveRegistry};
use crate::store::DynStore;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub healthy: bool,
    pub global: GlobalHealth,
    pub masters: Vec<MasterHealth>,
    pub pools: BTreeMap<Domain, bool>,
}

/// Store, pool manager, the three domain masters, and the global master.
pub struct Switchyard {
    store: DynStore,
    config: Arc<SwitchyardConfig>,
    pools: Arc<SlavePoolManager>,
    masters: BTreeMap<Domain, Arc<DomainMaster>>,
    global: Arc<GlobalMaster>,
}

impl Switchyard {
    /// Validate `config` and start everything, downstream first: pools,
    /// then domain masters, then the global master. Components that started
    /// before a failure are stopped again.
    pub async fn start(
        store: DynStore,
        registry: SlaveRegistry,
        config: SwitchyardConfig,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let config = Arc::new(config);

        let pools = SlavePoolManager::new(Arc::clone(&store), registry, Arc::clone(&config))?;
        let mut masters = BTreeMap::new();
        for domain in Domain::PIPELINE {
            let master = DomainMaster::new(
                domain_logic(domain),
                Arc::clone(&store),
                config.timing.workflow_ttl(),
                config.reaper.enabled.then(|| config.reaper.interval()),
            )?;
            masters.insert(domain, master);
        }
        let global = GlobalMaster::new(Arc::clone(&store), Arc::clone(&config))?;

        let system = Self {
            store,
            config,
            pools,
            masters,
            global,
        };
        if let Err(e) = system.start_components().await {
            tracing::error!("[Switchyard] Startup failed: {}", e);
            system.shutdown().await;
            return Err(e);
        }
        tracing::info!("[Switchyard] Pipeline ready");
        Ok(system)
    }

    async fn start_components(&self) -> Result<(), OrchestratorError> {
        let started = self.pools.start_pools(None, None).await?;
        if started == 0 {
            return Err(OrchestratorError::Config("no slave pools could be started".to_string()));
        }
        for master in self.masters.values() {
            master.start().await?;
        }
        self.global.start().await
    }

    /// Stop upstream first so nothing new enters a stopping pipeline.
    pub async fn shutdown(&self) {
        self.global.stop().await;
        for master in self.masters.values() {
            master.stop().await;
        }
        self.pools.stop_all_pools().await;
        tracing::info!("[Switchyard] Shut down");
    }

    pub fn store(&self) -> &DynStore {
        &self.store
    }

    pub fn config(&self) -> &SwitchyardConfig {
        &self.config
    }

    pub fn global(&self) -> &Arc<GlobalMaster> {
        &self.global
    }

    pub fn pools(&self) -> &Arc<SlavePoolManager> {
        &self.pools
    }

    pub fn master(&self, domain: Domain) -> Option<&Arc<DomainMaster>> {
        self.masters.get(&domain)
    }

    pub async fn health(&self) -> SystemHealth {
        let global = self.global.get_health().await;
        let mut masters = Vec::with_capacity(self.masters.len());
        for master in self.masters.values() {
            masters.push(master.get_health().await);
        }
        let pools = self.pools.get_health().await;
        let healthy = global.healthy
            && masters.iter().all(|m| m.running)
            && Domain::PIPELINE
                .iter()
                .all(|d| pools.get(d).copied().unwrap_or(false));
        SystemHealth {
            healthy,
            global,
            masters,
            pools,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slaves::echo;
    use crate::store::MemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut config = SwitchyardConfig::default();
        config.default_pool.max_size = 1;
        let result = Switchyard::start(
            Arc::new(MemoryStore::new()),
            echo::registry(Duration::ZERO),
            config,
        )
        .await;
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_requires_some_slaves() {
        let result = Switchyard::start(
            Arc::new(MemoryStore::new()),
            SlaveRegistry::new(),
            SwitchyardConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let system = Switchyard::start(
            Arc::new(MemoryStore::new()),
            echo::registry(Duration::ZERO),
            SwitchyardConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(system.pools().pool_count().await, 6);
        assert!(system.master(Domain::Query).unwrap().is_running());

        let health = system.health().await;
        assert!(health.healthy);
        assert_eq!(health.masters.len(), 3);

        system.shutdown().await;
        assert!(!system.global().is_running());
        assert_eq!(system.pools().pool_count().await, 0);
    }
}
