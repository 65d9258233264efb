//! Integration tests for the switchyard CLI commands.
//!
//! These exercise the same code paths as the binary, each with its own
//! in-memory pipeline.

use std::io::Write;
use std::time::Duration;

use switchyard_cli::commands;
use switchyard_cli::commands::run::RunOptions;
use switchyard_core::master::global::ResultStatus;
use switchyard_core::SwitchyardConfig;

fn quick_config() -> SwitchyardConfig {
    let mut config = SwitchyardConfig::default();
    config.timing.intake_retry_ms = 5;
    config
}

#[tokio::test]
async fn test_run_completes_query() {
    let options = RunOptions {
        query: "Find proteins related to insulin",
        context: Some(r#"{"lang": "en"}"#),
        timeout: Duration::from_secs(5),
        slave_delay: Duration::ZERO,
    };
    let response = commands::run::execute(quick_config(), &options).await.unwrap();
    assert!(!response.cached);
    assert_eq!(response.result.status, ResultStatus::Completed);

    let data = response.result.data.expect("Expected data");
    assert_eq!(data["query"], "Find proteins related to insulin");
    assert_eq!(data["context"]["lang"], "en");
    assert!(data["sparql_query"].as_str().unwrap().starts_with("SELECT"));
    assert!(data["response"].as_str().unwrap().contains("insulin"));
}

#[tokio::test]
async fn test_run_rejects_bad_context() {
    let options = RunOptions {
        query: "q",
        context: Some("{not json"),
        timeout: Duration::from_secs(1),
        slave_delay: Duration::ZERO,
    };
    let err = commands::run::execute(quick_config(), &options).await.err().unwrap();
    assert!(err.starts_with("Invalid --context JSON"));
}

#[tokio::test]
async fn test_run_times_out() {
    let options = RunOptions {
        query: "Find proteins",
        context: None,
        timeout: Duration::from_millis(20),
        slave_delay: Duration::from_millis(200),
    };
    let err = commands::run::execute(quick_config(), &options).await.err().unwrap();
    assert!(err.starts_with("Timed out waiting for workflow"));
}

#[tokio::test]
async fn test_demo_report() {
    let report = commands::demo::execute(quick_config(), 3, Duration::ZERO, Duration::from_secs(5), true)
        .await
        .unwrap();
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.completed(), 3);
    assert!(report.outcomes.iter().all(|o| o.processing_time.is_some()));

    let pools = report.pools.as_object().expect("Expected pool map");
    assert_eq!(pools.len(), 6);
    assert!(pools.contains_key("query.sparql_construction"));
    assert_eq!(report.health["healthy"], true);
    assert!(report.metrics.unwrap().contains("switchyard_global_workflows_created"));
}

#[test]
fn test_config_validate_and_load() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "load_balancing: weighted_random").unwrap();
    writeln!(file, "pools:").unwrap();
    writeln!(file, "  response.response_generation:").unwrap();
    writeln!(file, "    max_size: 4").unwrap();
    let path = file.path().to_str().unwrap();

    let config = commands::config::validate(path).unwrap();
    assert_eq!(config.load_balancing.as_str(), "weighted_random");
    assert!(commands::load_config(Some(path)).is_ok());
    assert!(commands::config::show(&config).is_ok());
}

#[test]
fn test_config_validate_rejects_small_pool() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "default_pool:").unwrap();
    writeln!(file, "  max_size: 1").unwrap();
    let path = file.path().to_str().unwrap();

    let err = commands::config::validate(path).unwrap_err();
    assert!(err.contains("below the minimum pool size"));
    assert!(commands::load_config(Some("/nonexistent/switchyard.yaml")).is_err());
}
