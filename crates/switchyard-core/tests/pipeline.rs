//! End-to-end pipeline tests over the in-memory store.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};

use common::{fast_config, registry_with, start, wait_for_result};
use switchyard_core::master::global::ResultStatus;
use switchyard_core::models::{Domain, SlaveType, StepStatus, TaskResult, WorkflowStatus};
use switchyard_core::slaves::{echo, SlaveOutcome};
use switchyard_core::{OrchestratorError, SharedStore, SlaveError};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_happy_path_runs_every_domain_in_order() {
    let (system, _store) = start(echo::registry(Duration::ZERO), fast_config()).await;
    let global = system.global();

    let response = global
        .process_query("Find proteins related to insulin", Value::Null, WAIT)
        .await
        .unwrap();
    assert!(!response.cached);
    assert_eq!(response.result.status, ResultStatus::Completed);
    let result = wait_for_result(global, &response.result.request_id, WAIT).await;
    assert_eq!(result.status, ResultStatus::Completed);
    assert!(result.error.is_none());

    let data = result.data.expect("completed result carries data");
    for key in ["refined_query", "entities", "mapped_entities", "sparql_query", "response"] {
        assert!(data.contains_key(key), "missing {}", key);
    }
    assert_eq!(data["validation"]["valid"], true);
    assert_eq!(result.domain_timings.len(), 3);
    assert!(result.processing_time.unwrap() >= 0.0);

    let status = global.get_workflow_status(&result.request_id).await.unwrap().unwrap();
    assert_eq!(status.status, WorkflowStatus::Completed);
    assert_eq!(status.completion_percentage, 100.0);
    assert!(status.errors.is_empty());
    let started: Vec<_> = status.steps.iter().map(|s| s.started_at.unwrap()).collect();
    let finished: Vec<_> = status.steps.iter().map(|s| s.completed_at.unwrap()).collect();
    for i in 1..started.len() {
        assert!(finished[i - 1] <= started[i], "step {} started before its predecessor finished", i);
    }

    for domain in Domain::PIPELINE {
        assert_eq!(system.master(domain).unwrap().active_count().await, 0);
    }
    assert_eq!(global.active_count().await, 0);
    system.shutdown().await;
}

#[tokio::test]
async fn test_nlp_failure_skips_remaining_domains() {
    let (registry, _) = registry_with(SlaveType::EntityRecognition, Duration::ZERO, |_| {
        Ok(SlaveOutcome::failed("model unavailable"))
    });
    let (system, _store) = start(registry, fast_config()).await;
    let global = system.global();

    let id = global.create_workflow("Find proteins", Value::Null).await.unwrap();
    let result = wait_for_result(global, &id, WAIT).await;
    assert_eq!(result.status, ResultStatus::Error);
    assert!(result.error.unwrap().contains("model unavailable"));

    let workflow = global.get_workflow(&id).await.unwrap().unwrap();
    let details = workflow.error_details.as_ref().expect("error details recorded");
    assert_eq!(details.domain, Domain::Nlp);
    assert_eq!(details.slave_type, Some(SlaveType::EntityRecognition));
    assert_eq!(workflow.step(Domain::Nlp).unwrap().status, StepStatus::Error);
    assert_eq!(workflow.step(Domain::Query).unwrap().status, StepStatus::Pending);
    assert_eq!(workflow.step(Domain::Response).unwrap().status, StepStatus::Pending);
    assert!(!workflow.data.contains_key("sparql_query"));
    assert!(workflow.completed_at.is_some());

    let master = system.master(Domain::Query).unwrap();
    assert_eq!(master.metrics().received.get(), 0);
    system.shutdown().await;
}

#[tokio::test]
async fn test_result_missing_its_field_fails_workflow() {
    let (registry, _) = registry_with(SlaveType::EntityRecognition, Duration::ZERO, |_| {
        Ok(SlaveOutcome::ok(json!({"status": "no model loaded"})))
    });
    let (system, _store) = start(registry, fast_config()).await;
    let global = system.global();

    let id = global.create_workflow("Find proteins", Value::Null).await.unwrap();
    let result = wait_for_result(global, &id, WAIT).await;
    assert_eq!(result.status, ResultStatus::Error);
    assert_eq!(result.error.as_deref(), Some("entity_recognition returned no entities"));

    let workflow = global.get_workflow(&id).await.unwrap().unwrap();
    assert!(!workflow.data.contains_key("entities"));
    assert_eq!(workflow.step(Domain::Nlp).unwrap().status, StepStatus::Error);
    system.shutdown().await;
}

#[tokio::test]
async fn test_slave_error_fails_workflow() {
    let (registry, _) = registry_with(SlaveType::OntologyMapping, Duration::ZERO, |_| {
        Err(SlaveError::Execution("ontology offline".into()))
    });
    let (system, _store) = start(registry, fast_config()).await;
    let global = system.global();

    let id = global.create_workflow("Find proteins", Value::Null).await.unwrap();
    let result = wait_for_result(global, &id, WAIT).await;
    assert_eq!(result.status, ResultStatus::Error);
    assert!(result.error.unwrap().contains("ontology offline"));

    let workflow = global.get_workflow(&id).await.unwrap().unwrap();
    assert_eq!(workflow.step(Domain::Nlp).unwrap().status, StepStatus::Completed);
    assert_eq!(workflow.step(Domain::Query).unwrap().status, StepStatus::Error);
    system.shutdown().await;
}

#[tokio::test]
async fn test_invalid_query_still_gets_a_response() {
    let (registry, script) = registry_with(SlaveType::Validation, Duration::ZERO, |_| {
        Ok(SlaveOutcome::ok(json!({"valid": false, "reason": "unbound variable"})))
    });
    let (system, _store) = start(registry, fast_config()).await;
    let global = system.global();

    let id = global.create_workflow("Find proteins", Value::Null).await.unwrap();
    let result = wait_for_result(global, &id, WAIT).await;
    assert_eq!(result.status, ResultStatus::Completed);
    let data = result.data.unwrap();
    assert_eq!(data["validation"]["valid"], false);
    assert_eq!(data["validation"]["reason"], "unbound variable");
    assert!(data.contains_key("response"));
    assert_eq!(script.call_count(), 1);
    system.shutdown().await;
}

#[tokio::test]
async fn test_nested_negative_verdict_reaches_response_as_invalid() {
    let (registry, _) = registry_with(SlaveType::Validation, Duration::ZERO, |_| {
        Ok(SlaveOutcome::ok(json!({"validation_result": {"valid": false, "errors": ["syntax"]}})))
    });
    let (system, _store) = start(registry, fast_config()).await;
    let global = system.global();

    let id = global.create_workflow("Find proteins", Value::Null).await.unwrap();
    let result = wait_for_result(global, &id, WAIT).await;
    assert_eq!(result.status, ResultStatus::Completed);
    let data = result.data.unwrap();
    assert_eq!(data["validation"], json!({"valid": false, "errors": ["syntax"]}));
    assert!(data.contains_key("response"));
    system.shutdown().await;
}

#[tokio::test]
async fn test_failed_validation_is_not_fatal() {
    let (registry, _) = registry_with(SlaveType::Validation, Duration::ZERO, |_| {
        Ok(SlaveOutcome::failed("endpoint timeout"))
    });
    let (system, _store) = start(registry, fast_config()).await;
    let global = system.global();

    let id = global.create_workflow("Find proteins", Value::Null).await.unwrap();
    let result = wait_for_result(global, &id, WAIT).await;
    assert_eq!(result.status, ResultStatus::Completed);
    assert_eq!(
        result.data.unwrap()["validation"],
        json!({"valid": false, "error": "endpoint timeout"})
    );
    system.shutdown().await;
}

#[tokio::test]
async fn test_late_and_unknown_results_are_ignored() {
    let (system, _store) = start(echo::registry(Duration::ZERO), fast_config()).await;
    let global = system.global();

    let id = global.create_workflow("Find proteins", Value::Null).await.unwrap();
    let result = wait_for_result(global, &id, WAIT).await;
    assert_eq!(result.status, ResultStatus::Completed);
    let before = global.get_workflow(&id).await.unwrap().unwrap();

    let nlp = system.master(Domain::Nlp).unwrap();
    let late = TaskResult {
        success: false,
        result: None,
        error: Some("late failure".into()),
        request_id: id.clone(),
        task_id: format!("{}_entity_recognition", id),
        domain: Domain::Nlp,
        slave_type: SlaveType::EntityRecognition,
        execution_time: 0.0,
    };
    nlp.on_slave_result(late.clone()).await.unwrap();

    let unknown = TaskResult {
        request_id: "no-such-workflow".into(),
        task_id: "no-such-workflow_entity_recognition".into(),
        ..late.clone()
    };
    nlp.on_slave_result(unknown).await.unwrap();

    let misrouted = TaskResult {
        domain: Domain::Query,
        ..late
    };
    nlp.on_slave_result(misrouted).await.unwrap();

    let after = global.get_workflow(&id).await.unwrap().unwrap();
    assert_eq!(after.status, WorkflowStatus::Completed);
    assert_eq!(after.completed_at, before.completed_at);
    assert!(after.error.is_none());
    system.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_workflows_complete_independently() {
    let (system, _store) = start(echo::registry(Duration::from_millis(5)), fast_config()).await;
    let global = system.global();

    let mut ids = Vec::new();
    for i in 0..8 {
        ids.push(global.create_workflow(&format!("query number {}", i), Value::Null).await.unwrap());
    }
    for (i, id) in ids.iter().enumerate() {
        let result = wait_for_result(global, id, WAIT).await;
        assert_eq!(result.status, ResultStatus::Completed, "workflow {}", id);
        assert_eq!(result.data.unwrap()["query"], format!("query number {}", i));
    }
    assert_eq!(global.recent_completions().await.len(), 8);
    system.shutdown().await;
}

#[tokio::test]
async fn test_cache_short_circuits_repeated_query() {
    let (registry, script) = registry_with(SlaveType::ResponseGeneration, Duration::ZERO, |params| {
        let query = params["query"].as_str().unwrap_or_default();
        Ok(SlaveOutcome::ok(json!({"response": format!("answer: {}", query)})))
    });
    let (system, _store) = start(registry, fast_config()).await;
    let global = system.global();

    let first = global.process_query("Find  Proteins", Value::Null, WAIT).await.unwrap();
    assert!(!first.cached);
    wait_for_result(global, &first.result.request_id, WAIT).await;
    let second = global.process_query("find proteins", Value::Null, WAIT).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.result.request_id, first.result.request_id);
    assert_eq!(second.result.data.unwrap()["response"], "answer: Find  Proteins");
    assert_eq!(script.call_count(), 1);

    let stats = global.cache_stats().await.unwrap();
    assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    assert_eq!(stats.hit_rate, 0.5);

    assert_eq!(global.clear_cache().await.unwrap(), 1);
    let third = global.process_query("find proteins", Value::Null, WAIT).await.unwrap();
    assert!(!third.cached);
    assert_eq!(script.call_count(), 2);
    system.shutdown().await;
}

#[tokio::test]
async fn test_process_query_times_out() {
    let (registry, _) = registry_with(SlaveType::ResponseGeneration, Duration::from_millis(500), |_| {
        Ok(SlaveOutcome::ok(json!({"response": "slow"})))
    });
    let (system, _store) = start(registry, fast_config()).await;

    let err = system
        .global()
        .process_query("Find proteins", Value::Null, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Timeout(_)));
    system.shutdown().await;
}

#[tokio::test]
async fn test_reaped_workflow_leaves_domain_master() {
    let (registry, _) = registry_with(SlaveType::QueryRefinement, Duration::from_secs(3600), |_| {
        Ok(SlaveOutcome::ok(json!({"refined_query": "never"})))
    });
    let mut config = fast_config();
    config.reaper.enabled = true;
    config.reaper.interval_secs = 0.02;
    config.reaper.stuck_after_secs = 0.1;
    let (system, _store) = start(registry, config).await;
    let global = system.global();

    let id = global.create_workflow("Find proteins", Value::Null).await.unwrap();
    let result = wait_for_result(global, &id, WAIT).await;
    assert_eq!(result.error.as_deref(), Some("workflow timed out in domain nlp"));
    assert_eq!(global.active_count().await, 0);

    let nlp = system.master(Domain::Nlp).unwrap();
    let deadline = tokio::time::Instant::now() + WAIT;
    while nlp.is_active(&id).await {
        assert!(tokio::time::Instant::now() < deadline, "nlp master kept the reaped workflow");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(nlp.active_count().await, 0);
    assert_eq!(nlp.get_health().await.oldest_active_secs, None);
    system.shutdown().await;
}

#[tokio::test]
async fn test_reaper_fails_stuck_workflow() {
    let (registry, _) = registry_with(SlaveType::ResponseGeneration, Duration::from_millis(500), |_| {
        Ok(SlaveOutcome::ok(json!({"response": "too late"})))
    });
    let mut config = fast_config();
    config.reaper.enabled = true;
    config.reaper.interval_secs = 0.02;
    config.reaper.stuck_after_secs = 0.1;
    let (system, _store) = start(registry, config).await;
    let global = system.global();

    let id = global.create_workflow("Find proteins", Value::Null).await.unwrap();
    let result = wait_for_result(global, &id, WAIT).await;
    assert_eq!(result.status, ResultStatus::Error);
    assert_eq!(result.error.as_deref(), Some("workflow timed out in domain response"));

    // The slow result lands after the reaper and must not revive the workflow.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let workflow = global.get_workflow(&id).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Error);
    assert!(!workflow.data.contains_key("response"));
    system.shutdown().await;
}

#[tokio::test]
async fn test_each_task_yields_exactly_one_result() {
    let (system, store) = start(echo::registry(Duration::ZERO), fast_config()).await;
    let mut results = Vec::new();
    for domain in Domain::PIPELINE {
        results.push(store.subscribe(&format!("domain:{}:results", domain)).await.unwrap());
    }
    let global = system.global();

    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(global.create_workflow(&format!("Find proteins {}", i), Value::Null).await.unwrap());
    }
    for id in &ids {
        assert_eq!(wait_for_result(global, id, WAIT).await.status, ResultStatus::Completed);
    }

    let mut seen: HashMap<String, usize> = HashMap::new();
    for subscription in &mut results {
        while let Ok(Some(message)) = tokio::time::timeout(Duration::from_millis(50), subscription.recv()).await {
            let result: TaskResult = serde_json::from_str(&message.payload).unwrap();
            *seen.entry(result.task_id).or_default() += 1;
        }
    }
    // two NLP tasks, three query tasks, one response task per workflow
    assert_eq!(seen.len(), ids.len() * 6);
    assert!(seen.values().all(|&count| count == 1));
    system.shutdown().await;
}

#[tokio::test]
async fn test_at_most_one_step_processing() {
    let (system, _store) = start(echo::registry(Duration::from_millis(3)), fast_config()).await;
    let global = system.global();

    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(global.create_workflow(&format!("Find proteins {}", i), Value::Null).await.unwrap());
    }
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let mut finished = 0;
        for id in &ids {
            let status = global.get_workflow_status(id).await.unwrap().unwrap();
            let processing = status
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Processing)
                .count();
            assert!(processing <= 1, "workflow {} has {} processing steps", id, processing);
            if status.completed_at.is_some() {
                finished += 1;
            }
        }
        if finished == ids.len() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "workflows did not finish");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    system.shutdown().await;
}
