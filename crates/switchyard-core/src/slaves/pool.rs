//! SlavePool: a bounded, auto-scaling set of slaves of one type.
//!
//! The pool subscribes to `slave_pool:{domain}:{slave_type}:tasks`, buffers
//! incoming tasks FIFO, and hands each one to an available slave chosen by
//! the load balancer. Every execution runs on its own tokio task and always
//! produces exactly one `TaskResult` on `domain:{domain}:results`.
//!
//! Size stays within `[MIN_POOL_SIZE, max_size]`. The auto-scaler adds a
//! slave when `pending / idle > 0.8`, removes the least-recently-used idle
//! slave when it drops below `0.2`, and replaces unhealthy slaves in place.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use super::{Slave, SlaveFactory, SlaveOutcome};
use crate::config::{PoolConfig, MIN_POOL_SIZE};
use crate::error::OrchestratorError;
use crate::load_balancer::{Candidate, LoadBalancer, Strategy};
use crate::metrics::PoolMetrics;
use crate::models::{Domain, SlaveType, Task, TaskResult};
use crate::store::{self, channels, DynStore, Subscription};

const SCALE_UP_LOAD: f64 = 0.8;
const SCALE_DOWN_LOAD: f64 = 0.2;

struct Member {
    id: String,
    slave: Arc<dyn Slave>,
    last_used: Instant,
    active: usize,
}

struct PoolState {
    members: Vec<Member>,
    pending: VecDeque<Task>,
    running: bool,
}

impl PoolState {
    fn busy(&self) -> usize {
        self.members.iter().filter(|m| m.active > 0).count()
    }

    /// `pending / max(1, size - busy)`
    fn load(&self) -> f64 {
        let idle = self.members.len().saturating_sub(self.busy()).max(1);
        self.pending.len() as f64 / idle as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAction {
    Up,
    Down,
    Hold,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoscaleReport {
    pub load: f64,
    pub action: ScaleAction,
    pub size: usize,
    pub replaced: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaveStatusView {
    pub id: String,
    pub index: usize,
    pub healthy: bool,
    pub active_tasks: usize,
    pub idle_secs: f64,
    pub status: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub domain: Domain,
    pub slave_type: SlaveType,
    pub running: bool,
    pub size: usize,
    pub max_size: usize,
    pub busy: usize,
    pub pending: usize,
    pub load: f64,
    pub slaves: Vec<SlaveStatusView>,
}

pub struct SlavePool {
    domain: Domain,
    slave_type: SlaveType,
    config: PoolConfig,
    factory: SlaveFactory,
    store: DynStore,
    balancer: LoadBalancer,
    state: Mutex<PoolState>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    next_member: AtomicU64,
    autoscale_interval: Duration,
    intake_retry: Duration,
    metrics: PoolMetrics,
}

impl SlavePool {
    /// Build a pool with `initial_size` slaves. Nothing runs until `start`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        domain: Domain,
        slave_type: SlaveType,
        config: PoolConfig,
        factory: SlaveFactory,
        store: DynStore,
        strategy: Strategy,
        autoscale_interval: Duration,
        intake_retry: Duration,
    ) -> Result<Arc<Self>, OrchestratorError> {
        let config = config.normalized();
        let metrics = PoolMetrics::new(&format!("{}_{}", domain.as_str(), slave_type.as_str()))?;
        let (shutdown, _) = watch::channel(false);
        let pool = Self {
            domain,
            slave_type,
            config,
            factory,
            store,
            balancer: LoadBalancer::new(strategy),
            state: Mutex::new(PoolState {
                members: Vec::with_capacity(config.max_size),
                pending: VecDeque::new(),
                running: false,
            }),
            wake: Notify::new(),
            shutdown,
            handles: tokio::sync::Mutex::new(Vec::new()),
            next_member: AtomicU64::new(0),
            autoscale_interval,
            intake_retry,
            metrics,
        };
        for _ in 0..config.initial_size {
            let member = pool.build_member()?;
            pool.state().members.push(member);
        }
        pool.refresh_gauges();
        Ok(Arc::new(pool))
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn slave_type(&self) -> SlaveType {
        self.slave_type
    }

    pub fn max_size(&self) -> usize {
        self.config.max_size
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    fn label(&self) -> String {
        format!("{}/{}", self.domain, self.slave_type)
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn build_member(&self) -> Result<Member, OrchestratorError> {
        let slave = (self.factory)()?;
        let n = self.next_member.fetch_add(1, Ordering::Relaxed);
        Ok(Member {
            id: format!("{}-{}-{}", self.domain, self.slave_type, n),
            slave,
            last_used: Instant::now(),
            active: 0,
        })
    }

    fn refresh_gauges(&self) {
        let st = self.state();
        self.metrics.size.set(st.members.len() as i64);
        self.metrics.busy.set(st.busy() as i64);
        self.metrics.pending.set(st.pending.len() as i64);
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────

    /// Subscribe to the task channel and spawn the intake and auto-scale
    /// loops. Calling `start` on a running pool does nothing.
    pub async fn start(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        {
            let mut st = self.state();
            if st.running {
                return Ok(());
            }
            st.running = true;
        }
        self.shutdown.send_replace(false);

        let channel = channels::slave_tasks(self.domain, self.slave_type);
        let subscription = match self.store.subscribe(&channel).await {
            Ok(sub) => sub,
            Err(e) => {
                self.state().running = false;
                return Err(e.into());
            }
        };

        let intake = tokio::spawn(Arc::clone(self).intake_loop(subscription, self.shutdown.subscribe()));
        let scaler = tokio::spawn(Arc::clone(self).autoscale_loop(self.shutdown.subscribe()));
        self.handles.lock().await.extend([intake, scaler]);

        tracing::info!(
            "[SlavePool {}] Started with {} slave(s) (max {})",
            self.label(),
            self.size(),
            self.config.max_size
        );
        Ok(())
    }

    /// Stop the loops. Executions already in flight still publish their
    /// results; queued tasks are dropped.
    pub async fn stop(&self) {
        {
            let mut st = self.state();
            if !st.running {
                return;
            }
            st.running = false;
        }
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        let dropped = {
            let mut st = self.state();
            let n = st.pending.len();
            st.pending.clear();
            n
        };
        self.refresh_gauges();
        if dropped > 0 {
            tracing::warn!("[SlavePool {}] Stopped with {} queued task(s) dropped", self.label(), dropped);
        } else {
            tracing::info!("[SlavePool {}] Stopped", self.label());
        }
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    // ─── Intake ────────────────────────────────────────────────────────────

    async fn intake_loop(self: Arc<Self>, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        let mut retry = tokio::time::interval(self.intake_retry);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                message = subscription.recv() => match message {
                    Some(message) => self.enqueue(&message.payload),
                    None => {
                        tracing::warn!("[SlavePool {}] Task channel closed", self.label());
                        break;
                    }
                },
                _ = self.wake.notified() => {}
                _ = retry.tick() => {}
            }
            self.drain();
        }
    }

    fn enqueue(&self, payload: &str) {
        let task: Task = match serde_json::from_str(payload) {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!("[SlavePool {}] Dropping malformed task: {}", self.label(), e);
                return;
            }
        };
        if task.slave_type != self.slave_type {
            tracing::warn!(
                "[SlavePool {}] Dropping task {} meant for {}",
                self.label(),
                task.task_id,
                task.slave_type
            );
            return;
        }
        tracing::debug!("[SlavePool {}] Queued task {}", self.label(), task.task_id);
        self.state().pending.push_back(task);
    }

    /// Hand queued tasks to available slaves until either runs out.
    fn drain(self: &Arc<Self>) {
        loop {
            let (task, member_id, slave) = {
                let mut st = self.state();
                if st.pending.is_empty() {
                    break;
                }
                let Some(index) = self.pick_member(&st) else {
                    break;
                };
                let Some(task) = st.pending.pop_front() else {
                    break;
                };
                let member = &mut st.members[index];
                member.active += 1;
                member.last_used = Instant::now();
                (task, member.id.clone(), Arc::clone(&member.slave))
            };
            self.refresh_gauges();
            tokio::spawn(Arc::clone(self).execute_on(member_id, slave, task));
        }
        self.refresh_gauges();
    }

    /// Healthy slaves with spare capacity, chosen by the load balancer.
    fn pick_member(&self, st: &PoolState) -> Option<usize> {
        let candidates: Vec<Candidate> = st
            .members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.active < self.config.slave_concurrency && m.slave.is_healthy())
            .map(|(index, m)| Candidate::new(index, m.active))
            .collect();
        self.balancer.select(&candidates)
    }

    // ─── Execution ─────────────────────────────────────────────────────────

    async fn execute_on(self: Arc<Self>, member_id: String, slave: Arc<dyn Slave>, task: Task) {
        let started = Instant::now();
        let parameters = task.parameters.clone();
        let outcome = match tokio::spawn(async move { slave.execute_task(&parameters).await }).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => SlaveOutcome::failed(e.to_string()),
            Err(join_error) => SlaveOutcome::failed(format!("slave panicked: {}", join_error)),
        };
        let elapsed = started.elapsed().as_secs_f64();

        let status = if outcome.success { "success" } else { "failure" };
        self.metrics.tasks.with_label_values(&[status]).inc();
        self.metrics.execution_seconds.observe(elapsed);

        let result = TaskResult {
            success: outcome.success,
            result: outcome.result,
            error: outcome.error,
            request_id: task.request_id,
            task_id: task.task_id,
            domain: self.domain,
            slave_type: self.slave_type,
            execution_time: elapsed,
        };
        if !result.success {
            tracing::warn!(
                "[SlavePool {}] Task {} failed: {}",
                self.label(),
                result.task_id,
                result.error_message()
            );
        }

        let channel = channels::domain_results(self.domain);
        match store::publish_json(&*self.store, &channel, &result).await {
            Ok(0) => tracing::warn!(
                "[SlavePool {}] No master listening for result of {}",
                self.label(),
                result.task_id
            ),
            Ok(_) => {}
            Err(e) => tracing::error!(
                "[SlavePool {}] Failed to publish result of {}: {}",
                self.label(),
                result.task_id,
                e
            ),
        }

        {
            let mut st = self.state();
            if let Some(member) = st.members.iter_mut().find(|m| m.id == member_id) {
                member.active = member.active.saturating_sub(1);
                member.last_used = Instant::now();
            }
        }
        self.refresh_gauges();
        self.wake.notify_one();
    }

    // ─── Scaling ───────────────────────────────────────────────────────────

    async fn autoscale_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.autoscale_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let report = self.autoscale_tick();
                    if report.action != ScaleAction::Hold || report.replaced > 0 {
                        tracing::info!(
                            "[SlavePool {}] Auto-scale: load {:.2}, {:?}, size {}, replaced {}",
                            self.label(),
                            report.load,
                            report.action,
                            report.size,
                            report.replaced
                        );
                    }
                    self.wake.notify_one();
                }
            }
        }
    }

    /// One auto-scaling decision followed by unhealthy-slave replacement.
    pub fn autoscale_tick(&self) -> AutoscaleReport {
        let (load, size) = {
            let st = self.state();
            (st.load(), st.members.len())
        };
        let action = if load > SCALE_UP_LOAD && size < self.config.max_size {
            if self.add_member() {
                ScaleAction::Up
            } else {
                ScaleAction::Hold
            }
        } else if load < SCALE_DOWN_LOAD && size > MIN_POOL_SIZE {
            if self.remove_lru_idle() {
                ScaleAction::Down
            } else {
                ScaleAction::Hold
            }
        } else {
            ScaleAction::Hold
        };
        let replaced = self.replace_unhealthy();
        self.refresh_gauges();
        AutoscaleReport {
            load,
            action,
            size: self.size(),
            replaced,
        }
    }

    fn add_member(&self) -> bool {
        let member = match self.build_member() {
            Ok(member) => member,
            Err(e) => {
                tracing::error!("[SlavePool {}] Failed to create slave: {}", self.label(), e);
                return false;
            }
        };
        let mut st = self.state();
        if st.members.len() >= self.config.max_size {
            return false;
        }
        st.members.push(member);
        true
    }

    /// Remove the least-recently-used slave that is not running anything.
    fn remove_lru_idle(&self) -> bool {
        let mut st = self.state();
        if st.members.len() <= MIN_POOL_SIZE {
            return false;
        }
        let victim = st
            .members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.active == 0)
            .min_by_key(|(_, m)| m.last_used)
            .map(|(index, _)| index);
        match victim {
            Some(index) => {
                let removed = st.members.remove(index);
                tracing::debug!("[SlavePool {}] Removed slave {}", self.label(), removed.id);
                true
            }
            None => false,
        }
    }

    /// Swap every unhealthy slave for a fresh one at the same position.
    pub fn replace_unhealthy(&self) -> usize {
        let unhealthy: Vec<String> = self
            .state()
            .members
            .iter()
            .filter(|m| !m.slave.is_healthy())
            .map(|m| m.id.clone())
            .collect();

        let mut replaced = 0;
        for old_id in unhealthy {
            let fresh = match self.build_member() {
                Ok(member) => member,
                Err(e) => {
                    tracing::error!(
                        "[SlavePool {}] Failed to replace unhealthy slave {}: {}",
                        self.label(),
                        old_id,
                        e
                    );
                    continue;
                }
            };
            let mut st = self.state();
            if let Some(slot) = st.members.iter_mut().find(|m| m.id == old_id) {
                tracing::warn!("[SlavePool {}] Replaced unhealthy slave {} with {}", self.label(), old_id, fresh.id);
                *slot = fresh;
                replaced += 1;
            }
        }
        replaced
    }

    /// Grow or shrink toward `target`, clamped to `[MIN_POOL_SIZE, max_size]`.
    /// Only idle slaves are removed, so the result may stay above `target`.
    pub fn scale_to(&self, target: usize) -> Result<usize, OrchestratorError> {
        let target = target.clamp(MIN_POOL_SIZE, self.config.max_size);
        while self.size() < target {
            let member = self.build_member()?;
            let mut st = self.state();
            if st.members.len() >= target {
                break;
            }
            st.members.push(member);
        }
        while self.size() > target {
            if !self.remove_lru_idle() {
                break;
            }
        }
        self.refresh_gauges();
        self.wake.notify_one();
        let size = self.size();
        tracing::info!("[SlavePool {}] Scaled to {} (target {})", self.label(), size, target);
        Ok(size)
    }

    // ─── Introspection ─────────────────────────────────────────────────────

    pub fn size(&self) -> usize {
        self.state().members.len()
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn busy(&self) -> usize {
        self.state().busy()
    }

    /// A pool is healthy while at least one slave is.
    pub fn get_health(&self) -> bool {
        self.state().members.iter().any(|m| m.slave.is_healthy())
    }

    /// Id of the slave the load balancer would hand the next task to.
    pub fn get_available_slave(&self) -> Option<String> {
        let st = self.state();
        self.pick_member(&st).map(|index| st.members[index].id.clone())
    }

    pub fn unhealthy_count(&self) -> usize {
        self.state().members.iter().filter(|m| !m.slave.is_healthy()).count()
    }

    pub fn get_status(&self) -> PoolStatus {
        let st = self.state();
        let now = Instant::now();
        PoolStatus {
            domain: self.domain,
            slave_type: self.slave_type,
            running: st.running,
            size: st.members.len(),
            max_size: self.config.max_size,
            busy: st.busy(),
            pending: st.pending.len(),
            load: st.load(),
            slaves: st
                .members
                .iter()
                .enumerate()
                .map(|(index, m)| SlaveStatusView {
                    id: m.id.clone(),
                    index,
                    healthy: m.slave.is_healthy(),
                    active_tasks: m.active,
                    idle_secs: now.duration_since(m.last_used).as_secs_f64(),
                    status: m.slave.report_status(),
                })
                .collect(),
        }
    }
}
