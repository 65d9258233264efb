use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::domain::{Domain, SlaveType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Processing,
    Completed,
    Error,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

/// One pipeline stage of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub domain: Domain,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowStep {
    fn pending(domain: Domain) -> Self {
        Self {
            domain,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Seconds between start and completion, if both are stamped.
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(seconds_between(start, end)),
            _ => None,
        }
    }
}

/// Where a workflow failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    pub domain: Domain,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slave_type: Option<SlaveType>,
}

/// The workflow document persisted under `workflow:{requestId}`.
///
/// Every mutation rewrites the whole document. `data` is append-only across
/// stages: a stage inserts its outputs and never removes another's keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub request_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_domain: Option<Domain>,
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub domain_timings: BTreeMap<Domain, f64>,
}

impl Workflow {
    /// A fresh workflow with every pipeline step pending.
    pub fn new(query: &str, context: Value) -> Self {
        let mut data = Map::new();
        data.insert("query".to_string(), Value::String(query.to_string()));
        data.insert("context".to_string(), context);
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            completed_at: None,
            data,
            steps: Domain::PIPELINE.iter().map(|d| WorkflowStep::pending(*d)).collect(),
            current_domain: None,
            status: WorkflowStatus::Processing,
            error: None,
            error_details: None,
            domain_timings: BTreeMap::new(),
        }
    }

    pub fn query(&self) -> Option<&str> {
        self.data.get("query").and_then(Value::as_str)
    }

    pub fn context(&self) -> Value {
        self.data.get("context").cloned().unwrap_or(Value::Null)
    }

    pub fn step(&self, domain: Domain) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.domain == domain)
    }

    pub fn step_mut(&mut self, domain: Domain) -> Option<&mut WorkflowStep> {
        self.steps.iter_mut().find(|s| s.domain == domain)
    }

    /// Mark `domain` as the processing step and hand ownership to it.
    /// Returns `false` when the document has no step for that domain.
    pub fn begin_step(&mut self, domain: Domain) -> bool {
        let Some(step) = self.step_mut(domain) else {
            return false;
        };
        step.status = StepStatus::Processing;
        step.started_at = Some(Utc::now());
        self.current_domain = Some(domain);
        true
    }

    /// Mark `domain` completed, returning how long the step took.
    pub fn complete_step(&mut self, domain: Domain) -> Option<f64> {
        let step = self.step_mut(domain)?;
        step.status = StepStatus::Completed;
        step.completed_at = Some(Utc::now());
        if step.started_at.is_none() {
            step.started_at = step.completed_at;
        }
        step.duration_secs()
    }

    /// Put the workflow into its terminal error state. The step for `domain`
    /// is marked as errored unless it is missing or already completed.
    pub fn fail(&mut self, domain: Domain, slave_type: Option<SlaveType>, message: impl Into<String>) {
        let message = message.into();
        if let Some(step) = self.step_mut(domain) {
            if step.status != StepStatus::Completed {
                step.status = StepStatus::Error;
                step.completed_at = Some(Utc::now());
                step.error = Some(message.clone());
            }
        }
        self.status = WorkflowStatus::Error;
        self.error = Some(message);
        self.error_details = Some(ErrorDetails { domain, slave_type });
    }

    pub fn has_error(&self) -> bool {
        self.status == WorkflowStatus::Error || self.steps.iter().any(|s| s.status == StepStatus::Error)
    }

    pub fn all_steps_completed(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }

    /// Terminal workflows are never mutated by a domain master again.
    pub fn is_terminal(&self) -> bool {
        self.has_error() || self.status == WorkflowStatus::Completed || self.completed_at.is_some()
    }

    /// The global master stamps `completedAt` exactly once.
    pub fn is_finalized(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn processing_step(&self) -> Option<Domain> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Processing)
            .map(|s| s.domain)
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let done = self.steps.iter().filter(|s| s.status == StepStatus::Completed).count();
        done as f64 / self.steps.len() as f64 * 100.0
    }

    /// Workflow-level and step-level error messages, deduplicated.
    pub fn errors(&self) -> Vec<String> {
        let mut errors: Vec<String> = self.steps.iter().filter_map(|s| s.error.clone()).collect();
        if let Some(err) = &self.error {
            if !errors.contains(err) {
                errors.push(err.clone());
            }
        }
        errors
    }

    /// Stamp `completedAt` and record per-domain timings.
    pub fn stamp_completion(&mut self) {
        self.completed_at = Some(Utc::now());
        self.domain_timings = self
            .steps
            .iter()
            .filter_map(|s| s.duration_secs().map(|secs| (s.domain, secs)))
            .collect();
    }

    /// End-to-end seconds, using the last step completion when the workflow
    /// has not been finalized yet.
    pub fn processing_time(&self) -> Option<f64> {
        let end = self
            .completed_at
            .or_else(|| self.steps.iter().filter_map(|s| s.completed_at).max())?;
        Some(seconds_between(self.created_at, end))
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_workflow_has_pending_steps() {
        let wf = Workflow::new("list all proteins", json!({"user": "u1"}));
        assert_eq!(wf.steps.len(), 3);
        assert!(wf.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(wf.query(), Some("list all proteins"));
        assert_eq!(wf.context()["user"], "u1");
        assert_eq!(wf.status, WorkflowStatus::Processing);
        assert!(!wf.is_terminal());
    }

    #[test]
    fn test_step_progression() {
        let mut wf = Workflow::new("q", Value::Null);
        assert!(wf.begin_step(Domain::Nlp));
        assert_eq!(wf.processing_step(), Some(Domain::Nlp));
        assert_eq!(wf.current_domain, Some(Domain::Nlp));

        wf.complete_step(Domain::Nlp);
        wf.begin_step(Domain::Query);
        assert_eq!(wf.processing_step(), Some(Domain::Query));
        assert!((wf.completion_percentage() - 100.0 / 3.0).abs() < 1e-9);

        wf.complete_step(Domain::Query);
        wf.begin_step(Domain::Response);
        wf.complete_step(Domain::Response);
        assert!(wf.all_steps_completed());
        assert_eq!(wf.completion_percentage(), 100.0);
    }

    #[test]
    fn test_fail_marks_step_and_workflow() {
        let mut wf = Workflow::new("q", Value::Null);
        wf.begin_step(Domain::Nlp);
        wf.fail(Domain::Nlp, Some(SlaveType::EntityRecognition), "model unavailable");

        assert!(wf.is_terminal());
        assert_eq!(wf.step(Domain::Nlp).unwrap().status, StepStatus::Error);
        assert_eq!(wf.step(Domain::Query).unwrap().status, StepStatus::Pending);
        assert_eq!(
            wf.error_details,
            Some(ErrorDetails {
                domain: Domain::Nlp,
                slave_type: Some(SlaveType::EntityRecognition)
            })
        );
        assert_eq!(wf.errors(), vec!["model unavailable".to_string()]);
    }

    #[test]
    fn test_fail_keeps_completed_step() {
        let mut wf = Workflow::new("q", Value::Null);
        wf.begin_step(Domain::Nlp);
        wf.complete_step(Domain::Nlp);
        wf.fail(Domain::Nlp, None, "late failure");
        assert_eq!(wf.step(Domain::Nlp).unwrap().status, StepStatus::Completed);
        assert_eq!(wf.status, WorkflowStatus::Error);
    }

    #[test]
    fn test_stamp_completion_records_timings() {
        let mut wf = Workflow::new("q", Value::Null);
        for domain in Domain::PIPELINE {
            wf.begin_step(domain);
            wf.complete_step(domain);
        }
        wf.stamp_completion();
        assert!(wf.is_finalized());
        assert_eq!(wf.domain_timings.len(), 3);
        assert!(wf.processing_time().unwrap() >= 0.0);
    }

    #[test]
    fn test_serialized_shape_is_camel_case() {
        let mut wf = Workflow::new("q", Value::Null);
        wf.begin_step(Domain::Nlp);
        let value = serde_json::to_value(&wf).unwrap();
        assert!(value.get("requestId").is_some());
        assert_eq!(value["currentDomain"], "nlp");
        assert_eq!(value["steps"][0]["status"], "processing");
        assert!(value["steps"][0].get("startedAt").is_some());

        let back: Workflow = serde_json::from_value(value).unwrap();
        assert_eq!(back.request_id, wf.request_id);
    }
}
