//! Domain masters: one coordinator per pipeline stage.
//!
//! A [`DomainMaster`] owns the workflows whose `currentDomain` is its domain.
//! It listens on `domain:{domain}:requests` for incoming workflows and on
//! `domain:{domain}:results` for slave results, and drives each workflow
//! through its domain's [`DomainLogic`]:
//!
//!   1. On request: mark the step processing, ask the logic for first tasks,
//!      dispatch them to the slave pools
//!   2. On each result: fold it into `data` (or fail the workflow), dispatch
//!      follow-up tasks, flag the slave type done
//!   3. When every required slave type is flagged: complete the step and
//!      forward to the next domain, or to `global:completions` at the end
//!
//! Errors anywhere go straight to `global:completions`; remaining domains
//! are skipped.

pub mod global;
pub mod nlp;
pub mod query;
pub mod response;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::OrchestratorError;
use crate::metrics::MasterMetrics;
use crate::models::{Domain, SlaveType, Task, TaskResult, Workflow};
use crate::store::{self, channels, keys, DynStore, Subscription};

// ─── Domain logic ──────────────────────────────────────────────────────────

/// A task the logic wants dispatched.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub slave_type: SlaveType,
    pub parameters: Value,
}

impl TaskSpec {
    pub fn new(slave_type: SlaveType, parameters: Value) -> Self {
        Self { slave_type, parameters }
    }
}

/// Per-domain behaviour plugged into a [`DomainMaster`]. An `Err` fails the
/// workflow with that message.
pub trait DomainLogic: Send + Sync {
    fn domain(&self) -> Domain;

    /// Slave types that must all report before the step completes.
    fn required(&self) -> &'static [SlaveType];

    /// First task(s) for a newly arrived workflow.
    fn start(&self, workflow: &Workflow) -> Result<Vec<TaskSpec>, String>;

    /// Fold a result into the workflow and return follow-up tasks.
    fn on_result(&self, workflow: &mut Workflow, result: &TaskResult) -> Result<Vec<TaskSpec>, String>;
}

/// The built-in logic for `domain`.
pub fn domain_logic(domain: Domain) -> Box<dyn DomainLogic> {
    match domain {
        Domain::Nlp => Box::new(nlp::NlpLogic),
        Domain::Query => Box::new(query::QueryLogic),
        Domain::Response => Box::new(response::ResponseLogic),
    }
}

/// `result.field(key)` or a failure naming what was missing.
pub(crate) fn required_field(result: &TaskResult, key: &str) -> Result<Value, String> {
    result
        .field(key)
        .ok_or_else(|| format!("{} returned no {}", result.slave_type, key))
}

// ─── Master ────────────────────────────────────────────────────────────────

struct ActiveWorkflow {
    received_at: Instant,
    dispatched: HashMap<String, SlaveType>,
    completed: HashSet<SlaveType>,
}

impl ActiveWorkflow {
    fn new() -> Self {
        Self {
            received_at: Instant::now(),
            dispatched: HashMap::new(),
            completed: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterHealth {
    pub domain: Domain,
    pub running: bool,
    pub active_workflows: usize,
    pub oldest_active_secs: Option<f64>,
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
}

pub struct DomainMaster {
    logic: Box<dyn DomainLogic>,
    store: DynStore,
    workflow_ttl: Duration,
    sweep_interval: Option<Duration>,
    active: RwLock<HashMap<String, ActiveWorkflow>>,
    metrics: MasterMetrics,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DomainMaster {
    /// `sweep_interval` enables the loop that drops active entries whose
    /// workflow was finished elsewhere (reaped or expired).
    pub fn new(
        logic: Box<dyn DomainLogic>,
        store: DynStore,
        workflow_ttl: Duration,
        sweep_interval: Option<Duration>,
    ) -> Result<Arc<Self>, OrchestratorError> {
        let metrics = MasterMetrics::new(logic.domain().as_str())?;
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            logic,
            store,
            workflow_ttl,
            sweep_interval,
            active: RwLock::new(HashMap::new()),
            metrics,
            running: AtomicBool::new(false),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }))
    }

    pub fn domain(&self) -> Domain {
        self.logic.domain()
    }

    pub fn metrics(&self) -> &MasterMetrics {
        &self.metrics
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────

    /// Subscribe to the request and result channels and spawn one loop for
    /// each. Messages on a channel are handled one at a time, in order.
    pub async fn start(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(false);
        let domain = self.domain();

        let subscriptions = async {
            let requests = self.store.subscribe(&channels::domain_requests(domain)).await?;
            let results = self.store.subscribe(&channels::domain_results(domain)).await?;
            Ok::<_, OrchestratorError>((requests, results))
        }
        .await;
        let (requests, results) = match subscriptions {
            Ok(subs) => subs,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let request_loop = tokio::spawn(Arc::clone(self).request_loop(requests, self.shutdown.subscribe()));
        let result_loop = tokio::spawn(Arc::clone(self).result_loop(results, self.shutdown.subscribe()));
        let mut handles = self.handles.lock().await;
        handles.extend([request_loop, result_loop]);
        if let Some(interval) = self.sweep_interval {
            handles.push(tokio::spawn(Arc::clone(self).sweep_loop(interval, self.shutdown.subscribe())));
        }
        drop(handles);

        tracing::info!("[DomainMaster:{}] Started", domain);
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("[DomainMaster:{}] Stopped", self.domain());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn request_loop(self: Arc<Self>, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                message = subscription.recv() => {
                    let Some(message) = message else { break };
                    match serde_json::from_str::<Workflow>(&message.payload) {
                        Ok(workflow) => {
                            let request_id = workflow.request_id.clone();
                            if let Err(e) = self.on_workflow_request(workflow).await {
                                tracing::error!(
                                    "[DomainMaster:{}] Failed to handle workflow {}: {}",
                                    self.domain(),
                                    request_id,
                                    e
                                );
                            }
                        }
                        Err(e) => tracing::warn!(
                            "[DomainMaster:{}] Dropping malformed workflow request: {}",
                            self.domain(),
                            e
                        ),
                    }
                }
            }
        }
    }

    async fn result_loop(self: Arc<Self>, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                message = subscription.recv() => {
                    let Some(message) = message else { break };
                    match serde_json::from_str::<TaskResult>(&message.payload) {
                        Ok(result) => {
                            let task_id = result.task_id.clone();
                            if let Err(e) = self.on_slave_result(result).await {
                                tracing::error!(
                                    "[DomainMaster:{}] Failed to handle result {}: {}",
                                    self.domain(),
                                    task_id,
                                    e
                                );
                            }
                        }
                        Err(e) => tracing::warn!(
                            "[DomainMaster:{}] Dropping malformed slave result: {}",
                            self.domain(),
                            e
                        ),
                    }
                }
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
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
                    if let Err(e) = self.sweep_orphans().await {
                        tracing::warn!("[DomainMaster:{}] Sweep failed: {}", self.domain(), e);
                    }
                }
            }
        }
    }

    /// Forget active workflows whose stored copy is gone or already terminal.
    pub async fn sweep_orphans(&self) -> Result<usize, OrchestratorError> {
        let ids: Vec<String> = self.active.read().await.keys().cloned().collect();
        let mut dropped = 0;
        for request_id in ids {
            let stored = store::load_json::<Workflow>(&*self.store, &keys::workflow(&request_id)).await?;
            if stored.as_ref().is_some_and(|wf| !wf.is_terminal()) {
                continue;
            }
            if self.active.write().await.remove(&request_id).is_some() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::info!(
                "[DomainMaster:{}] Dropped {} workflow(s) finished elsewhere",
                self.domain(),
                dropped
            );
        }
        Ok(dropped)
    }

    // ─── Workflow handling ─────────────────────────────────────────────────

    /// Take ownership of an incoming workflow and dispatch its first task(s).
    pub async fn on_workflow_request(&self, mut workflow: Workflow) -> Result<(), OrchestratorError> {
        let domain = self.domain();
        if workflow.is_terminal() {
            tracing::warn!(
                "[DomainMaster:{}] Ignoring terminal workflow {}",
                domain,
                workflow.request_id
            );
            return Ok(());
        }
        if !workflow.begin_step(domain) {
            return self
                .handle_error(workflow, None, format!("workflow has no {} step", domain))
                .await;
        }
        self.metrics.received.inc();
        tracing::info!("[DomainMaster:{}] Received workflow {}", domain, workflow.request_id);

        let tasks = match self.logic.start(&workflow) {
            Ok(tasks) => tasks,
            Err(message) => return self.handle_error(workflow, None, message).await,
        };

        self.active
            .write()
            .await
            .insert(workflow.request_id.clone(), ActiveWorkflow::new());
        self.persist(&workflow).await?;
        self.dispatch_all(workflow, tasks).await
    }

    /// Fold one slave result into its workflow.
    pub async fn on_slave_result(&self, result: TaskResult) -> Result<(), OrchestratorError> {
        let domain = self.domain();
        if result.domain != domain {
            tracing::warn!(
                "[DomainMaster:{}] Ignoring result {} addressed to {}",
                domain,
                result.task_id,
                result.domain
            );
            return Ok(());
        }
        let status = if result.success { "success" } else { "failure" };
        self.metrics
            .results
            .with_label_values(&[result.slave_type.as_str(), status])
            .inc();

        {
            let active = self.active.read().await;
            let Some(entry) = active.get(&result.request_id) else {
                tracing::warn!(
                    "[DomainMaster:{}] Result {} for unknown workflow {}",
                    domain,
                    result.task_id,
                    result.request_id
                );
                return Ok(());
            };
            if !entry.dispatched.contains_key(&result.task_id) {
                tracing::warn!("[DomainMaster:{}] Result for unknown task {}", domain, result.task_id);
                return Ok(());
            }
            if entry.completed.contains(&result.slave_type) {
                tracing::debug!("[DomainMaster:{}] Duplicate result {}", domain, result.task_id);
                return Ok(());
            }
        }

        let key = keys::workflow(&result.request_id);
        let Some(mut workflow) = store::load_json::<Workflow>(&*self.store, &key).await? else {
            tracing::warn!(
                "[DomainMaster:{}] Workflow {} expired before result {}",
                domain,
                result.request_id,
                result.task_id
            );
            self.active.write().await.remove(&result.request_id);
            return Ok(());
        };
        if workflow.is_terminal() {
            tracing::debug!(
                "[DomainMaster:{}] Workflow {} already terminal, dropping {}",
                domain,
                workflow.request_id,
                result.task_id
            );
            self.active.write().await.remove(&result.request_id);
            return Ok(());
        }

        let follow_ups = match self.logic.on_result(&mut workflow, &result) {
            Ok(tasks) => tasks,
            Err(message) => return self.handle_error(workflow, Some(result.slave_type), message).await,
        };

        let done = {
            let mut active = self.active.write().await;
            let Some(entry) = active.get_mut(&result.request_id) else {
                return Ok(());
            };
            entry.completed.insert(result.slave_type);
            self.logic.required().iter().all(|t| entry.completed.contains(t))
        };

        self.persist(&workflow).await?;
        if done {
            let next = domain.next();
            self.complete_workflow(workflow, next).await
        } else {
            self.dispatch_all(workflow, follow_ups).await
        }
    }

    /// Complete this domain's step and hand the workflow on. `next = None`
    /// publishes to `global:completions`.
    pub async fn complete_workflow(&self, mut workflow: Workflow, next: Option<Domain>) -> Result<(), OrchestratorError> {
        let domain = self.domain();
        if let Some(secs) = workflow.complete_step(domain) {
            self.metrics.processing_seconds.observe(secs);
        }
        let waited = self
            .active
            .write()
            .await
            .remove(&workflow.request_id)
            .map(|entry| entry.received_at.elapsed());
        self.metrics.completed.inc();

        let Some(next_domain) = next else {
            tracing::info!(
                "[DomainMaster:{}] Workflow {} finished pipeline ({:.3}s here)",
                domain,
                workflow.request_id,
                waited.unwrap_or_default().as_secs_f64()
            );
            return self.publish_terminal(&workflow).await;
        };

        if !workflow.begin_step(next_domain) {
            let message = format!("no eligible next step: {}", next_domain);
            workflow.fail(next_domain, None, message.clone());
            self.metrics.failed.inc();
            tracing::error!("[DomainMaster:{}] Workflow {}: {}", domain, workflow.request_id, message);
            return self.publish_terminal(&workflow).await;
        }
        self.persist(&workflow).await?;

        let channel = channels::domain_requests(next_domain);
        let receivers = store::publish_json(&*self.store, &channel, &workflow).await?;
        if receivers == 0 {
            let message = format!("no master subscribed to {}", channel);
            workflow.fail(next_domain, None, message.clone());
            self.metrics.failed.inc();
            tracing::error!("[DomainMaster:{}] Workflow {}: {}", domain, workflow.request_id, message);
            return self.publish_terminal(&workflow).await;
        }
        tracing::info!(
            "[DomainMaster:{}] Workflow {} forwarded to {}",
            domain,
            workflow.request_id,
            next_domain
        );
        Ok(())
    }

    /// Fail the workflow in this domain and publish it as terminal.
    pub async fn handle_error(
        &self,
        mut workflow: Workflow,
        slave_type: Option<SlaveType>,
        message: String,
    ) -> Result<(), OrchestratorError> {
        let domain = self.domain();
        tracing::error!(
            "[DomainMaster:{}] Workflow {} failed{}: {}",
            domain,
            workflow.request_id,
            slave_type.map(|t| format!(" in {}", t)).unwrap_or_default(),
            message
        );
        workflow.fail(domain, slave_type, message);
        self.active.write().await.remove(&workflow.request_id);
        self.metrics.failed.inc();
        self.publish_terminal(&workflow).await
    }

    /// Publish a task to its pool. Nobody listening is a dispatch failure.
    pub async fn dispatch_to_pool(&self, task: &Task) -> Result<(), OrchestratorError> {
        let channel = channels::slave_tasks(self.domain(), task.slave_type);
        let receivers = store::publish_json(&*self.store, &channel, task).await?;
        if receivers == 0 {
            return Err(OrchestratorError::Dispatch {
                request_id: task.request_id.clone(),
                reason: format!("no pool subscribed to {}", channel),
            });
        }
        tracing::debug!("[DomainMaster:{}] Dispatched {}", self.domain(), task.task_id);
        Ok(())
    }

    async fn dispatch_all(&self, workflow: Workflow, tasks: Vec<TaskSpec>) -> Result<(), OrchestratorError> {
        for spec in tasks {
            let task = Task::new(&workflow.request_id, spec.slave_type, spec.parameters);
            {
                let mut active = self.active.write().await;
                let Some(entry) = active.get_mut(&workflow.request_id) else {
                    return Ok(());
                };
                entry.dispatched.insert(task.task_id.clone(), task.slave_type);
            }
            if let Err(e) = self.dispatch_to_pool(&task).await {
                return self.handle_error(workflow, Some(spec.slave_type), e.to_string()).await;
            }
        }
        Ok(())
    }

    async fn persist(&self, workflow: &Workflow) -> Result<(), OrchestratorError> {
        store::save_json(
            &*self.store,
            &keys::workflow(&workflow.request_id),
            workflow,
            self.workflow_ttl,
        )
        .await
    }

    async fn publish_terminal(&self, workflow: &Workflow) -> Result<(), OrchestratorError> {
        self.persist(workflow).await?;
        let receivers = store::publish_json(&*self.store, channels::GLOBAL_COMPLETIONS, workflow).await?;
        if receivers == 0 {
            tracing::warn!(
                "[DomainMaster:{}] No listener on {} for workflow {}",
                self.domain(),
                channels::GLOBAL_COMPLETIONS,
                workflow.request_id
            );
        }
        Ok(())
    }

    // ─── Introspection ─────────────────────────────────────────────────────

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn is_active(&self, request_id: &str) -> bool {
        self.active.read().await.contains_key(request_id)
    }

    pub async fn get_health(&self) -> MasterHealth {
        let active = self.active.read().await;
        MasterHealth {
            domain: self.domain(),
            running: self.is_running(),
            active_workflows: active.len(),
            oldest_active_secs: active
                .values()
                .map(|entry| entry.received_at.elapsed().as_secs_f64())
                .fold(None, |oldest: Option<f64>, secs| Some(oldest.map_or(secs, |o| o.max(secs)))),
            received: self.metrics.received.get(),
            completed: self.metrics.completed.get(),
            failed: self.metrics.failed.get(),
        }
    }
}
