//! CLI command implementations.
//!
//! Every command runs the whole pipeline in-process over a `MemoryStore`
//! with the built-in echo slaves.

pub mod config;
pub mod demo;
pub mod run;

use std::sync::Arc;
use std::time::Duration;

use switchyard_core::master::global::{GlobalMaster, WorkflowResultView};
use switchyard_core::slaves::echo;
use switchyard_core::{MemoryStore, Switchyard, SwitchyardConfig};

/// Load the config file when given, defaults otherwise.
pub fn load_config(path: Option<&str>) -> Result<SwitchyardConfig, String> {
    match path {
        Some(path) => SwitchyardConfig::from_file(path).map_err(|e| format!("{}: {}", path, e)),
        None => Ok(SwitchyardConfig::default()),
    }
}

/// Start every component with echo slaves that take `slave_delay` per task.
pub async fn start_pipeline(config: SwitchyardConfig, slave_delay: Duration) -> Result<Switchyard, String> {
    let store = Arc::new(MemoryStore::new());
    Switchyard::start(store, echo::registry(slave_delay), config)
        .await
        .map_err(|e| format!("Failed to start pipeline: {}", e))
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

/// Parse a `--context` argument. Empty means no context.
pub fn parse_context(raw: Option<&str>) -> Result<serde_json::Value, String> {
    match raw {
        None | Some("") => Ok(serde_json::Value::Null),
        Some(raw) => serde_json::from_str(raw).map_err(|e| format!("Invalid --context JSON: {}", e)),
    }
}

/// Wait up to `timeout` for the global master to finalize a workflow, then
/// return its result (still `processing` if it never was).
pub async fn await_finalized(global: &GlobalMaster, request_id: &str, timeout: Duration) -> WorkflowResultView {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let finalized = matches!(
            global.get_workflow(request_id).await,
            Ok(Some(workflow)) if workflow.is_finalized()
        );
        if finalized || tokio::time::Instant::now() >= deadline {
            return global.get_workflow_result(request_id).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
