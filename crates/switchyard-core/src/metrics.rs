//! Prometheus instruments for masters and pools.
//!
//! Each component owns its own `Registry`, so two pools (or a restarted
//! pool) never collide on metric names. Exposition is left to the host;
//! [`render`] produces the text format for ad-hoc inspection.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "switchyard";

const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

fn opts(subsystem: &str, name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE).subsystem(subsystem)
}

fn histogram(registry: &Registry, subsystem: &str, name: &str, help: &str) -> Result<Histogram, prometheus::Error> {
    let h = Histogram::with_opts(
        HistogramOpts::new(name, help)
            .namespace(NAMESPACE)
            .subsystem(subsystem)
            .buckets(LATENCY_BUCKETS.to_vec()),
    )?;
    registry.register(Box::new(h.clone()))?;
    Ok(h)
}

fn int_counter(registry: &Registry, subsystem: &str, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let c = IntCounter::with_opts(opts(subsystem, name, help))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn int_gauge(registry: &Registry, subsystem: &str, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let g = IntGauge::with_opts(opts(subsystem, name, help))?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

/// Render a registry in the Prometheus text format.
pub fn render(registry: &Registry) -> Result<String, prometheus::Error> {
    TextEncoder::new().encode_to_string(&registry.gather())
}

// ─── Slave pool ────────────────────────────────────────────────────────────

pub struct PoolMetrics {
    registry: Registry,
    pub size: IntGauge,
    pub busy: IntGauge,
    pub pending: IntGauge,
    pub tasks: IntCounterVec,
    pub execution_seconds: Histogram,
}

impl PoolMetrics {
    /// `subsystem` is `{domain}_{slave_type}`.
    pub fn new(subsystem: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let tasks = IntCounterVec::new(
            opts(subsystem, "tasks_total", "Tasks executed, by outcome"),
            &["status"],
        )?;
        registry.register(Box::new(tasks.clone()))?;
        Ok(Self {
            size: int_gauge(&registry, subsystem, "slaves", "Slaves in the pool")?,
            busy: int_gauge(&registry, subsystem, "busy_slaves", "Slaves currently executing a task")?,
            pending: int_gauge(&registry, subsystem, "pending_tasks", "Tasks waiting for a slave")?,
            execution_seconds: histogram(
                &registry,
                subsystem,
                "task_execution_seconds",
                "Time spent inside the slave",
            )?,
            tasks,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

// ─── Domain master ─────────────────────────────────────────────────────────

pub struct MasterMetrics {
    registry: Registry,
    pub received: IntCounter,
    pub completed: IntCounter,
    pub failed: IntCounter,
    pub results: IntCounterVec,
    pub processing_seconds: Histogram,
}

impl MasterMetrics {
    pub fn new(domain: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let subsystem = format!("{}_master", domain);
        let results = IntCounterVec::new(
            opts(&subsystem, "slave_results_total", "Slave results received, by type and outcome"),
            &["slave_type", "status"],
        )?;
        registry.register(Box::new(results.clone()))?;
        Ok(Self {
            received: int_counter(&registry, &subsystem, "workflows_received_total", "Workflows received")?,
            completed: int_counter(&registry, &subsystem, "workflows_completed_total", "Workflows whose step completed")?,
            failed: int_counter(&registry, &subsystem, "workflows_failed_total", "Workflows errored in this domain")?,
            processing_seconds: histogram(
                &registry,
                &subsystem,
                "step_processing_seconds",
                "Time from step start to step completion",
            )?,
            results,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

// ─── Pool manager ──────────────────────────────────────────────────────────

pub struct ManagerMetrics {
    registry: Registry,
    pub pool_size: IntGaugeVec,
    pub pool_capacity: IntGaugeVec,
}

impl ManagerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let pool_size = IntGaugeVec::new(
            opts("pools", "size", "Current slaves per pool"),
            &["domain", "slave_type"],
        )?;
        let pool_capacity = IntGaugeVec::new(
            opts("pools", "capacity", "Maximum slaves per pool"),
            &["domain", "slave_type"],
        )?;
        registry.register(Box::new(pool_size.clone()))?;
        registry.register(Box::new(pool_capacity.clone()))?;
        Ok(Self {
            registry,
            pool_size,
            pool_capacity,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

// ─── Global master ─────────────────────────────────────────────────────────

pub struct GlobalMetrics {
    registry: Registry,
    pub created: IntCounter,
    pub completed: IntCounter,
    pub failed: IntCounter,
    pub active: IntGauge,
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub end_to_end_seconds: Histogram,
}

impl GlobalMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let s = "global";
        Ok(Self {
            created: int_counter(&registry, s, "workflows_created_total", "Workflows created")?,
            completed: int_counter(&registry, s, "workflows_completed_total", "Workflows finalized successfully")?,
            failed: int_counter(&registry, s, "workflows_failed_total", "Workflows finalized with an error")?,
            active: int_gauge(&registry, s, "active_workflows", "Workflows not yet finalized")?,
            cache_hits: int_counter(&registry, s, "cache_hits_total", "Query cache hits")?,
            cache_misses: int_counter(&registry, s, "cache_misses_total", "Query cache misses")?,
            end_to_end_seconds: histogram(
                &registry,
                s,
                "workflow_seconds",
                "Time from creation to finalization",
            )?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_registries_are_isolated() {
        let a = PoolMetrics::new("nlp_query_refinement").unwrap();
        let b = PoolMetrics::new("nlp_query_refinement").unwrap();
        a.size.set(3);
        b.size.set(5);
        assert_eq!(a.size.get(), 3);
        assert_eq!(b.size.get(), 5);
    }

    #[test]
    fn test_render_contains_namespaced_names() {
        let m = MasterMetrics::new("query").unwrap();
        m.received.inc();
        m.results.with_label_values(&["validation", "success"]).inc();
        let text = render(m.registry()).unwrap();
        assert!(text.contains("switchyard_query_master_workflows_received_total 1"));
        assert!(text.contains("slave_type=\"validation\""));
    }
}
