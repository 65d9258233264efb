//! Shared fixtures for the pipeline integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use switchyard_core::master::global::{GlobalMaster, WorkflowResultView};
use switchyard_core::models::SlaveType;
use switchyard_core::slaves::{echo, Slave, SlaveOutcome, SlaveRegistry};
use switchyard_core::{MemoryStore, SlaveError, Switchyard, SwitchyardConfig};

type Handler = dyn Fn(&Value) -> Result<SlaveOutcome, SlaveError> + Send + Sync;

/// A slave whose behavior is supplied by the test.
pub struct ScriptedSlave {
    handler: Arc<Handler>,
    delay: Duration,
    healthy: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Slave for ScriptedSlave {
    async fn execute_task(&self, parameters: &Value) -> Result<SlaveOutcome, SlaveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.handler)(parameters)
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Handle onto every slave a scripted factory builds.
#[derive(Clone)]
pub struct Script {
    pub calls: Arc<AtomicUsize>,
    pub healthy: Arc<AtomicBool>,
}

impl Script {
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Echo slaves everywhere except `slave_type`, which runs `handler`.
pub fn registry_with<F>(slave_type: SlaveType, delay: Duration, handler: F) -> (SlaveRegistry, Script)
where
    F: Fn(&Value) -> Result<SlaveOutcome, SlaveError> + Send + Sync + 'static,
{
    let mut registry = echo::registry(Duration::ZERO);
    let handler: Arc<Handler> = Arc::new(handler);
    let script = Script {
        calls: Arc::new(AtomicUsize::new(0)),
        healthy: Arc::new(AtomicBool::new(true)),
    };
    let shared = script.clone();
    registry.register_fn(slave_type, move || {
        Ok(Arc::new(ScriptedSlave {
            handler: Arc::clone(&handler),
            delay,
            healthy: Arc::clone(&shared.healthy),
            calls: Arc::clone(&shared.calls),
        }) as Arc<dyn Slave>)
    });
    (registry, script)
}

/// Short intervals so background loops react within a test's lifetime.
pub fn fast_config() -> SwitchyardConfig {
    let mut config = SwitchyardConfig::default();
    config.timing.autoscale_interval_secs = 0.05;
    config.timing.monitor_interval_secs = 0.05;
    config.timing.health_check_interval_secs = 0.05;
    config.timing.intake_retry_ms = 5;
    config.reaper.enabled = false;
    config
}

pub async fn start(registry: SlaveRegistry, config: SwitchyardConfig) -> (Switchyard, MemoryStore) {
    let store = MemoryStore::new();
    let system = Switchyard::start(Arc::new(store.clone()), registry, config)
        .await
        .expect("pipeline should start");
    (system, store)
}

/// Poll until the global master has finalized the workflow, then return
/// its result.
pub async fn wait_for_result(global: &GlobalMaster, request_id: &str, timeout: Duration) -> WorkflowResultView {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let finalized = global
            .get_workflow(request_id)
            .await
            .ok()
            .flatten()
            .map(|w| w.is_finalized())
            .unwrap_or(false);
        if finalized {
            return global.get_workflow_result(request_id).await;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workflow {} not finalized after {:?}",
            request_id,
            timeout
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
