//! GlobalMaster: entry point and finalizer of the pipeline.
//!
//! Creates workflows and dispatches them to the first domain through that
//! domain's circuit breaker, finalizes workflows arriving on
//! `global:completions`, answers status/result queries, reaps workflows that
//! never finish, and caches successful results per normalized query.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::config::SwitchyardConfig;
use crate::error::OrchestratorError;
use crate::health::{HealthChecker, HealthProbe, ProbeStatus};
use crate::metrics::GlobalMetrics;
use crate::models::{Domain, Workflow, WorkflowStatus, WorkflowStep};
use crate::store::{self, channels, keys, DynStore, Subscription};

const STORE_PROBE: &str = "store";
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ─── Views ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatusView {
    pub request_id: String,
    pub status: WorkflowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_domain: Option<Domain>,
    pub completion_percentage: f64,
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Processing,
    Completed,
    Error,
    NotFound,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::NotFound => "not_found",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResultView {
    pub request_id: String,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub domain_timings: BTreeMap<Domain, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowResultView {
    fn bare(request_id: &str, status: ResultStatus, error: Option<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            status,
            data: None,
            error,
            processing_time: None,
            domain_timings: BTreeMap::new(),
            completed_at: None,
        }
    }

    fn from_workflow(workflow: Workflow) -> Self {
        let status = if workflow.has_error() {
            ResultStatus::Error
        } else if workflow.all_steps_completed() {
            ResultStatus::Completed
        } else {
            ResultStatus::Processing
        };
        if status == ResultStatus::Processing {
            return Self::bare(&workflow.request_id, status, None);
        }
        let error = if status == ResultStatus::Error {
            workflow.error.clone().or_else(|| workflow.errors().into_iter().next())
        } else {
            None
        };
        Self {
            processing_time: workflow.processing_time(),
            request_id: workflow.request_id,
            status,
            data: Some(workflow.data),
            error,
            domain_timings: workflow.domain_timings,
            completed_at: workflow.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRecord {
    pub request_id: String,
    pub status: WorkflowStatus,
    pub completed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalHealth {
    pub healthy: bool,
    pub running: bool,
    pub active_workflows: usize,
    pub circuits: BTreeMap<Domain, CircuitSnapshot>,
    pub store: Option<ProbeStatus>,
}

/// Cached outcome of a successful workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResult {
    pub request_id: String,
    pub query: String,
    #[serde(default)]
    pub sparql_query: Option<Value>,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub validation: Option<Value>,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub enabled: bool,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entries: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub cached: bool,
    pub result: WorkflowResultView,
}

// ─── Store probe ───────────────────────────────────────────────────────────

struct StoreProbe {
    store: DynStore,
}

#[async_trait]
impl HealthProbe for StoreProbe {
    fn name(&self) -> &str {
        STORE_PROBE
    }

    async fn check(&self) -> Result<(), String> {
        self.store.ping().await.map_err(|e| e.to_string())
    }
}

// ─── GlobalMaster ──────────────────────────────────────────────────────────

pub struct GlobalMaster {
    store: DynStore,
    config: Arc<SwitchyardConfig>,
    breakers: BTreeMap<Domain, Arc<CircuitBreaker>>,
    active: RwLock<HashMap<String, Instant>>,
    history: RwLock<VecDeque<CompletionRecord>>,
    metrics: GlobalMetrics,
    health: HealthChecker,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl GlobalMaster {
    pub fn new(store: DynStore, config: Arc<SwitchyardConfig>) -> Result<Arc<Self>, OrchestratorError> {
        let breakers = Domain::PIPELINE
            .iter()
            .map(|d| {
                (
                    *d,
                    Arc::new(CircuitBreaker::new(d.as_str(), config.circuit_breaker.clone())),
                )
            })
            .collect();
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            store,
            config,
            breakers,
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            metrics: GlobalMetrics::new()?,
            health: HealthChecker::new(),
            running: AtomicBool::new(false),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }))
    }

    pub fn metrics(&self) -> &GlobalMetrics {
        &self.metrics
    }

    pub fn circuit_breaker(&self, domain: Domain) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(&domain).cloned()
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────

    /// Start the completion listener, the reaper (when enabled), and the
    /// store health probe.
    pub async fn start(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(false);

        let subscription = match self.store.subscribe(channels::GLOBAL_COMPLETIONS).await {
            Ok(sub) => sub,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let mut handles = vec![tokio::spawn(
            Arc::clone(self).completion_loop(subscription, self.shutdown.subscribe()),
        )];
        if self.config.reaper.enabled {
            handles.push(tokio::spawn(Arc::clone(self).reaper_loop(self.shutdown.subscribe())));
        }

        self.health
            .register(Arc::new(StoreProbe {
                store: Arc::clone(&self.store),
            }))
            .await;
        handles.push(
            self.health
                .spawn(self.config.timing.health_check_interval(), self.shutdown.subscribe()),
        );
        self.handles.lock().await.extend(handles);

        tracing::info!("[GlobalMaster] Started");
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
        tracing::info!("[GlobalMaster] Stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ─── Workflow creation ─────────────────────────────────────────────────

    /// Create a workflow and dispatch it to the first domain.
    ///
    /// Dispatch failure (open circuit, store error, or nobody subscribed) is
    /// terminal: the workflow is persisted in the error state and
    /// `OrchestratorError::Dispatch` is returned. There is no retry.
    pub async fn create_workflow(&self, input: &str, context: Value) -> Result<String, OrchestratorError> {
        let mut workflow = Workflow::new(input, context);
        let request_id = workflow.request_id.clone();
        self.persist(&workflow).await?;

        let first = Domain::PIPELINE[0];
        workflow.begin_step(first);
        self.persist(&workflow).await?;
        self.active.write().await.insert(request_id.clone(), Instant::now());
        self.metrics.created.inc();
        self.metrics.active.inc();

        let channel = channels::domain_requests(first);
        let outcome = match self.breakers.get(&first) {
            Some(breaker) => {
                breaker
                    .call(async {
                        let receivers = store::publish_json(&*self.store, &channel, &workflow).await?;
                        if receivers == 0 {
                            return Err(OrchestratorError::Dispatch {
                                request_id: request_id.clone(),
                                reason: format!("no master subscribed to {}", channel),
                            });
                        }
                        Ok::<_, OrchestratorError>(receivers)
                    })
                    .await
            }
            None => Err(OrchestratorError::Internal(format!("no circuit breaker for {}", first))),
        };

        match outcome {
            Ok(_) => {
                tracing::info!("[GlobalMaster] Created workflow {}", request_id);
                Ok(request_id)
            }
            Err(e) => {
                let reason = match e {
                    OrchestratorError::Dispatch { reason, .. } => reason,
                    other => other.to_string(),
                };
                tracing::error!("[GlobalMaster] Dispatch of workflow {} failed: {}", request_id, reason);
                workflow.fail(first, None, format!("dispatch failed: {}", reason));
                workflow.stamp_completion();
                self.persist(&workflow).await?;
                self.forget(&request_id).await;
                self.metrics.failed.inc();
                self.record_history(&workflow).await;
                Err(OrchestratorError::Dispatch { request_id, reason })
            }
        }
    }

    // ─── Queries ───────────────────────────────────────────────────────────

    pub async fn get_workflow(&self, request_id: &str) -> Result<Option<Workflow>, OrchestratorError> {
        store::load_json(&*self.store, &keys::workflow(request_id)).await
    }

    pub async fn get_workflow_status(
        &self,
        request_id: &str,
    ) -> Result<Option<WorkflowStatusView>, OrchestratorError> {
        let Some(workflow) = self.get_workflow(request_id).await? else {
            return Ok(None);
        };
        let status = if workflow.has_error() {
            WorkflowStatus::Error
        } else {
            workflow.status
        };
        Ok(Some(WorkflowStatusView {
            completion_percentage: workflow.completion_percentage(),
            errors: workflow.errors(),
            request_id: workflow.request_id,
            status,
            current_domain: workflow.current_domain,
            created_at: workflow.created_at,
            completed_at: workflow.completed_at,
            steps: workflow.steps,
        }))
    }

    /// Result of a workflow. Never fails: a missing workflow is `not_found`
    /// and a store failure is reported as `error`.
    pub async fn get_workflow_result(&self, request_id: &str) -> WorkflowResultView {
        match self.get_workflow(request_id).await {
            Ok(Some(workflow)) => WorkflowResultView::from_workflow(workflow),
            Ok(None) => WorkflowResultView::bare(request_id, ResultStatus::NotFound, None),
            Err(e) => WorkflowResultView::bare(request_id, ResultStatus::Error, Some(e.to_string())),
        }
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn recent_completions(&self) -> Vec<CompletionRecord> {
        self.history.read().await.iter().cloned().collect()
    }

    // ─── Completion ────────────────────────────────────────────────────────

    async fn completion_loop(self: Arc<Self>, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
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
                            if let Err(e) = self.finalize(workflow).await {
                                tracing::error!("[GlobalMaster] Failed to finalize {}: {}", request_id, e);
                            }
                        }
                        Err(e) => tracing::warn!("[GlobalMaster] Dropping malformed completion: {}", e),
                    }
                }
            }
        }
    }

    /// Stamp, classify, and persist a workflow that left the pipeline.
    /// Workflows already finalized (by an earlier message or the reaper)
    /// are left untouched.
    pub async fn finalize(&self, mut workflow: Workflow) -> Result<(), OrchestratorError> {
        let request_id = workflow.request_id.clone();
        if let Some(stored) = self.get_workflow(&request_id).await? {
            if stored.is_finalized() {
                tracing::debug!("[GlobalMaster] Workflow {} already finalized", request_id);
                return Ok(());
            }
        }

        workflow.stamp_completion();
        if !workflow.has_error() && workflow.all_steps_completed() {
            workflow.status = WorkflowStatus::Completed;
        } else {
            if workflow.error.is_none() {
                workflow.error = Some("workflow left the pipeline with unfinished steps".to_string());
            }
            workflow.status = WorkflowStatus::Error;
        }
        // A finalized document implies its cache entry already exists.
        if workflow.status == WorkflowStatus::Completed && self.config.cache.enabled {
            if let Err(e) = self.cache_result(&workflow).await {
                tracing::warn!("[GlobalMaster] Failed to cache result of {}: {}", request_id, e);
            }
        }
        self.persist(&workflow).await?;

        if let Some(started) = self.forget(&request_id).await {
            self.metrics.end_to_end_seconds.observe(started.elapsed().as_secs_f64());
        }
        self.record_history(&workflow).await;

        match workflow.status {
            WorkflowStatus::Completed => {
                self.metrics.completed.inc();
                tracing::info!(
                    "[GlobalMaster] Workflow {} completed in {:.3}s",
                    request_id,
                    workflow.processing_time().unwrap_or_default()
                );
            }
            _ => {
                self.metrics.failed.inc();
                tracing::warn!(
                    "[GlobalMaster] Workflow {} finished with error: {}",
                    request_id,
                    workflow.error.as_deref().unwrap_or("unknown")
                );
            }
        }
        Ok(())
    }

    async fn forget(&self, request_id: &str) -> Option<Instant> {
        let removed = self.active.write().await.remove(request_id);
        if removed.is_some() {
            self.metrics.active.dec();
        }
        removed
    }

    async fn record_history(&self, workflow: &Workflow) {
        let limit = self.config.history_size;
        if limit == 0 {
            return;
        }
        let mut history = self.history.write().await;
        history.push_back(CompletionRecord {
            request_id: workflow.request_id.clone(),
            status: workflow.status,
            completed_at: workflow.completed_at.unwrap_or_else(Utc::now),
            processing_time: workflow.processing_time(),
            error: workflow.error.clone(),
        });
        while history.len() > limit {
            history.pop_front();
        }
    }

    // ─── Reaper ────────────────────────────────────────────────────────────

    async fn reaper_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.reaper.interval());
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
                    if let Err(e) = self.reap_stuck().await {
                        tracing::error!("[GlobalMaster] Reaper pass failed: {}", e);
                    }
                }
            }
        }
    }

    /// Fail every active workflow older than `reaper.stuck_after`.
    /// Returns the request ids that were reaped.
    pub async fn reap_stuck(&self) -> Result<Vec<String>, OrchestratorError> {
        let stuck_after = self.config.reaper.stuck_after();
        let candidates: Vec<String> = self
            .active
            .read()
            .await
            .iter()
            .filter(|(_, started)| started.elapsed() >= stuck_after)
            .map(|(id, _)| id.clone())
            .collect();

        let mut reaped = Vec::new();
        for request_id in candidates {
            let Some(mut workflow) = self.get_workflow(&request_id).await? else {
                tracing::warn!("[GlobalMaster] Workflow {} expired while active", request_id);
                self.forget(&request_id).await;
                continue;
            };
            if workflow.is_finalized() {
                self.forget(&request_id).await;
                continue;
            }
            let domain = workflow
                .processing_step()
                .or(workflow.current_domain)
                .unwrap_or(Domain::PIPELINE[0]);
            workflow.fail(domain, None, format!("workflow timed out in domain {}", domain));
            workflow.stamp_completion();
            self.persist(&workflow).await?;
            self.forget(&request_id).await;
            self.metrics.failed.inc();
            self.record_history(&workflow).await;
            tracing::warn!("[GlobalMaster] Reaped workflow {} stuck in {}", request_id, domain);
            reaped.push(request_id);
        }
        Ok(reaped)
    }

    // ─── Query cache ───────────────────────────────────────────────────────

    /// `cache:query:{sha256(normalized query || canonical context)}`
    pub fn cache_key(input: &str, context: &Value) -> String {
        let normalized = input
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");
        let context = if context.is_null() {
            String::new()
        } else {
            context.to_string()
        };
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update(b"||");
        hasher.update(context.as_bytes());
        keys::query_cache(&hex::encode(hasher.finalize()))
    }

    async fn cache_result(&self, workflow: &Workflow) -> Result<(), OrchestratorError> {
        let query = workflow.query().unwrap_or_default().to_string();
        let key = Self::cache_key(&query, &workflow.context());
        let cached = CachedResult {
            request_id: workflow.request_id.clone(),
            query,
            sparql_query: workflow.data.get("sparql_query").cloned(),
            response: workflow.data.get("response").cloned(),
            validation: workflow.data.get("validation").cloned(),
            cached_at: Utc::now(),
        };
        store::save_json(&*self.store, &key, &cached, self.config.cache.ttl()).await
    }

    pub async fn cached_result(&self, input: &str, context: &Value) -> Result<Option<CachedResult>, OrchestratorError> {
        store::load_json(&*self.store, &Self::cache_key(input, context)).await
    }

    /// Answer a query synchronously: serve it from the cache, or run a
    /// workflow and poll until it finishes or `timeout` elapses.
    pub async fn process_query(
        &self,
        input: &str,
        context: Value,
        timeout: Duration,
    ) -> Result<QueryResponse, OrchestratorError> {
        if self.config.cache.enabled {
            match self.cached_result(input, &context).await {
                Ok(Some(cached)) => {
                    self.metrics.cache_hits.inc();
                    tracing::debug!("[GlobalMaster] Cache hit for workflow {}", cached.request_id);
                    return Ok(QueryResponse {
                        cached: true,
                        result: cached_view(cached),
                    });
                }
                Ok(None) => self.metrics.cache_misses.inc(),
                Err(e) => {
                    self.metrics.cache_misses.inc();
                    tracing::warn!("[GlobalMaster] Cache lookup failed: {}", e);
                }
            }
        }

        let request_id = self.create_workflow(input, context).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let result = self.get_workflow_result(&request_id).await;
            if result.status.is_terminal() {
                return Ok(QueryResponse { cached: false, result });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OrchestratorError::Timeout(request_id));
            }
            tokio::time::sleep(RESULT_POLL_INTERVAL).await;
        }
    }

    pub async fn cache_stats(&self) -> Result<CacheStats, OrchestratorError> {
        let entries = self.store.keys(keys::QUERY_CACHE_PREFIX).await?.len();
        let hits = self.metrics.cache_hits.get();
        let misses = self.metrics.cache_misses.get();
        let lookups = hits + misses;
        Ok(CacheStats {
            enabled: self.config.cache.enabled,
            hits,
            misses,
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
            entries,
        })
    }

    /// Remove every cached result. Returns how many were removed.
    pub async fn clear_cache(&self) -> Result<usize, OrchestratorError> {
        let keys = self.store.keys(keys::QUERY_CACHE_PREFIX).await?;
        let mut removed = 0;
        for key in keys {
            if self.store.delete(&key).await? {
                removed += 1;
            }
        }
        tracing::info!("[GlobalMaster] Cleared {} cached result(s)", removed);
        Ok(removed)
    }

    // ─── Health ────────────────────────────────────────────────────────────

    /// Liveness, circuit state per domain, and store connectivity (probed now).
    pub async fn get_health(&self) -> GlobalHealth {
        let probes = self.health.check_all().await;
        let store = probes.get(STORE_PROBE).cloned();
        let circuits: BTreeMap<Domain, CircuitSnapshot> = self
            .breakers
            .iter()
            .map(|(domain, breaker)| (*domain, breaker.snapshot()))
            .collect();
        let running = self.is_running();
        let store_ok = store.as_ref().map(|s| s.healthy).unwrap_or(false);
        let first_open = circuits
            .get(&Domain::PIPELINE[0])
            .map(|c| c.state == CircuitState::Open)
            .unwrap_or(false);
        GlobalHealth {
            healthy: running && store_ok && !first_open,
            running,
            active_workflows: self.active_count().await,
            circuits,
            store,
        }
    }

    async fn persist(&self, workflow: &Workflow) -> Result<(), OrchestratorError> {
        store::save_json(
            &*self.store,
            &keys::workflow(&workflow.request_id),
            workflow,
            self.config.timing.workflow_ttl(),
        )
        .await
    }
}

fn cached_view(cached: CachedResult) -> WorkflowResultView {
    let mut data = Map::new();
    data.insert("query".to_string(), Value::String(cached.query));
    for (key, value) in [
        ("sparql_query", cached.sparql_query),
        ("response", cached.response),
        ("validation", cached.validation),
    ] {
        if let Some(value) = value {
            data.insert(key.to_string(), value);
        }
    }
    WorkflowResultView {
        request_id: cached.request_id,
        status: ResultStatus::Completed,
        data: Some(data),
        error: None,
        processing_time: None,
        domain_timings: BTreeMap::new(),
        completed_at: Some(cached.cached_at),
    }
}
