//! Runtime configuration, loadable from YAML.
//!
//! ```yaml
//! load_balancing: least_connections
//! default_pool:
//!   initial_size: 2
//!   max_size: 10
//! pools:
//!   query.sparql_construction:
//!     initial_size: 4
//!     max_size: 16
//! circuit_breaker:
//!   failureThreshold: 5
//!   recoveryTimeoutSecs: 60
//! timing:
//!   workflow_ttl_secs: 3600
//!   autoscale_interval_secs: 60
//! reaper:
//!   stuck_after_secs: 300
//! ```
//!
//! Every field is optional; missing fields take the defaults below.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::OrchestratorError;
use crate::load_balancer::Strategy;
use crate::models::{Domain, SlaveType};

/// Pools never shrink below this many slaves.
pub const MIN_POOL_SIZE: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchyardConfig {
    /// Per-pool overrides keyed by `"{domain}.{slave_type}"`.
    pub pools: HashMap<String, PoolConfig>,
    pub default_pool: PoolConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub timing: TimingConfig,
    pub reaper: ReaperConfig,
    pub cache: CacheConfig,
    /// Finalized workflows kept in the global master's history.
    pub history_size: usize,
    pub load_balancing: Strategy,
}

impl Default for SwitchyardConfig {
    fn default() -> Self {
        Self {
            pools: HashMap::new(),
            default_pool: PoolConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            timing: TimingConfig::default(),
            reaper: ReaperConfig::default(),
            cache: CacheConfig::default(),
            history_size: 100,
            load_balancing: Strategy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub initial_size: usize,
    pub max_size: usize,
    /// Tasks one slave may run at once before it stops being eligible.
    pub slave_concurrency: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 2,
            max_size: 10,
            slave_concurrency: 1,
        }
    }
}

impl PoolConfig {
    /// Clamp the initial size into `[MIN_POOL_SIZE, max_size]`.
    pub fn normalized(self) -> Self {
        let max_size = self.max_size.max(MIN_POOL_SIZE);
        Self {
            initial_size: self.initial_size.clamp(MIN_POOL_SIZE, max_size),
            max_size,
            slave_concurrency: self.slave_concurrency.max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub workflow_ttl_secs: u64,
    pub autoscale_interval_secs: f64,
    /// How often the pool manager refreshes its size/capacity gauges.
    pub monitor_interval_secs: f64,
    pub health_check_interval_secs: f64,
    /// Safety tick for pool intake when no message or completion wakes it.
    pub intake_retry_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            workflow_ttl_secs: 3600,
            autoscale_interval_secs: 60.0,
            monitor_interval_secs: 5.0,
            health_check_interval_secs: 30.0,
            intake_retry_ms: 100,
        }
    }
}

impl TimingConfig {
    pub fn workflow_ttl(&self) -> Duration {
        Duration::from_secs(self.workflow_ttl_secs)
    }

    pub fn autoscale_interval(&self) -> Duration {
        Duration::from_secs_f64(self.autoscale_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs_f64(self.monitor_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.health_check_interval_secs)
    }

    pub fn intake_retry(&self) -> Duration {
        Duration::from_millis(self.intake_retry_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub enabled: bool,
    pub interval_secs: f64,
    /// Workflows unfinished after this long are failed.
    pub stuck_after_secs: f64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30.0,
            stuck_after_secs: 300.0,
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }

    pub fn stuck_after(&self) -> Duration {
        Duration::from_secs_f64(self.stuck_after_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 86_400,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl SwitchyardConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, OrchestratorError> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| OrchestratorError::Config(format!("Failed to parse config YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, OrchestratorError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::Config(format!("Failed to read config file '{}': {}", path, e)))?;
        Self::from_yaml(&content)
    }

    pub fn to_yaml(&self) -> Result<String, OrchestratorError> {
        serde_yaml::to_string(self)
            .map_err(|e| OrchestratorError::Config(format!("Failed to render config: {}", e)))
    }

    pub fn pool_key(domain: Domain, slave_type: SlaveType) -> String {
        format!("{}.{}", domain.as_str(), slave_type.as_str())
    }

    /// Effective settings for one pool, already normalized.
    pub fn pool(&self, domain: Domain, slave_type: SlaveType) -> PoolConfig {
        self.pools
            .get(&Self::pool_key(domain, slave_type))
            .copied()
            .unwrap_or(self.default_pool)
            .normalized()
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let mut problems = Vec::new();

        let mut check_pool = |name: &str, pool: &PoolConfig| {
            if pool.max_size < MIN_POOL_SIZE {
                problems.push(format!(
                    "{}: max_size {} is below the minimum pool size {}",
                    name, pool.max_size, MIN_POOL_SIZE
                ));
            }
            if pool.initial_size > pool.max_size {
                problems.push(format!(
                    "{}: initial_size {} exceeds max_size {}",
                    name, pool.initial_size, pool.max_size
                ));
            }
        };
        check_pool("default_pool", &self.default_pool);
        for (key, pool) in &self.pools {
            check_pool(key, pool);
        }

        for key in self.pools.keys() {
            let known = key.split_once('.').and_then(|(d, t)| {
                let domain = Domain::from_str(d)?;
                let slave_type = SlaveType::from_str(t)?;
                (slave_type.domain() == domain).then_some(())
            });
            if known.is_none() {
                problems.push(format!("pools: unknown pool '{}'", key));
            }
        }

        if self.circuit_breaker.failure_threshold == 0 {
            problems.push("circuit_breaker: failureThreshold must be at least 1".to_string());
        }
        let intervals = [
            ("timing.autoscale_interval_secs", self.timing.autoscale_interval_secs),
            ("timing.monitor_interval_secs", self.timing.monitor_interval_secs),
            ("timing.health_check_interval_secs", self.timing.health_check_interval_secs),
            ("reaper.interval_secs", self.reaper.interval_secs),
            ("reaper.stuck_after_secs", self.reaper.stuck_after_secs),
        ];
        for (name, value) in intervals {
            if !(value.is_finite() && value > 0.0) {
                problems.push(format!("{} must be positive", name));
            }
        }
        if self.timing.workflow_ttl_secs == 0 {
            problems.push("timing.workflow_ttl_secs must be positive".to_string());
        }
        if self.timing.intake_retry_ms == 0 {
            problems.push("timing.intake_retry_ms must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Config(problems.join("; ")))
        }
    }
}
