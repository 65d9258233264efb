//! `switchyard demo`: push a batch of queries through the pipeline and
//! report outcomes, pool status, and health.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use switchyard_core::master::global::ResultStatus;
use switchyard_core::metrics;
use switchyard_core::SwitchyardConfig;

use super::{await_finalized, start_pipeline};

const SAMPLE_QUERIES: &[&str] = &[
    "Find proteins related to insulin",
    "Which genes are associated with diabetes",
    "List drugs targeting kinase receptors",
    "Show pathways involving glucose metabolism",
    "What diseases are linked to mutations in BRCA1",
];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoOutcome {
    pub request_id: String,
    pub query: String,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoReport {
    pub outcomes: Vec<DemoOutcome>,
    pub pools: Value,
    pub health: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<String>,
}

impl DemoReport {
    pub fn completed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == ResultStatus::Completed)
            .count()
    }
}

/// Submit `count` queries at once, wait for each, and collect a report.
pub async fn execute(
    config: SwitchyardConfig,
    count: usize,
    slave_delay: Duration,
    timeout: Duration,
    with_metrics: bool,
) -> Result<DemoReport, String> {
    let system = start_pipeline(config, slave_delay).await?;
    let global = system.global();

    let mut submitted = Vec::with_capacity(count);
    for i in 0..count {
        let query = SAMPLE_QUERIES[i % SAMPLE_QUERIES.len()].to_string();
        match global.create_workflow(&query, Value::Null).await {
            Ok(request_id) => submitted.push((request_id, query)),
            Err(e) => tracing::warn!("[Demo] Failed to submit '{}': {}", query, e),
        }
    }

    let mut outcomes = Vec::with_capacity(submitted.len());
    for (request_id, query) in submitted {
        let result = await_finalized(global, &request_id, timeout).await;
        outcomes.push(DemoOutcome {
            request_id,
            query,
            status: result.status,
            processing_time: result.processing_time,
            error: result.error,
        });
    }

    let pools = serde_json::to_value(system.pools().get_status().await).map_err(|e| e.to_string())?;
    let health = serde_json::to_value(system.health().await).map_err(|e| e.to_string())?;
    let metrics = if with_metrics {
        let mut text = metrics::render(global.metrics().registry()).map_err(|e| e.to_string())?;
        text.push_str(&metrics::render(system.pools().metrics().registry()).map_err(|e| e.to_string())?);
        Some(text)
    } else {
        None
    };

    system.shutdown().await;
    Ok(DemoReport {
        outcomes,
        pools,
        health,
        metrics,
    })
}

pub async fn run(
    config: SwitchyardConfig,
    count: usize,
    slave_delay: Duration,
    timeout: Duration,
    with_metrics: bool,
) -> Result<(), String> {
    println!("🚦 Running {} queries through nlp → query → response", count);
    println!();
    let report = execute(config, count, slave_delay, timeout, with_metrics).await?;

    println!("┌──────────────────────────────────────┬────────────┬──────────┐");
    println!("│ Request                              │ Status     │ Time     │");
    println!("├──────────────────────────────────────┼────────────┼──────────┤");
    for outcome in &report.outcomes {
        let time = outcome
            .processing_time
            .map(|s| format!("{:.3}s", s))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "│ {:<36} │ {:<10} │ {:<8} │",
            outcome.request_id,
            outcome.status.as_str(),
            time
        );
    }
    println!("└──────────────────────────────────────┴────────────┴──────────┘");
    println!();

    println!("Pools:");
    super::print_json(&report.pools);
    println!();
    println!("Health:");
    super::print_json(&report.health);
    if let Some(text) = &report.metrics {
        println!();
        print!("{}", text);
    }

    let completed = report.completed();
    println!();
    if completed == report.outcomes.len() && completed == count {
        println!("🎉 {}/{} workflows completed", completed, count);
        Ok(())
    } else {
        Err(format!("{}/{} workflows completed", completed, count))
    }
}
