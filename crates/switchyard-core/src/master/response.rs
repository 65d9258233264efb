//! Response stage: a single response-generation task, then the workflow
//! leaves the pipeline.

use serde_json::{json, Value};

use super::{required_field, DomainLogic, TaskSpec};
use crate::models::{Domain, SlaveType, TaskResult, Workflow};

pub struct ResponseLogic;

impl DomainLogic for ResponseLogic {
    fn domain(&self) -> Domain {
        Domain::Response
    }

    fn required(&self) -> &'static [SlaveType] {
        &[SlaveType::ResponseGeneration]
    }

    fn start(&self, workflow: &Workflow) -> Result<Vec<TaskSpec>, String> {
        let field = |key: &str| workflow.data.get(key).cloned().unwrap_or(Value::Null);
        Ok(vec![TaskSpec::new(
            SlaveType::ResponseGeneration,
            json!({
                "query": field("query"),
                "refined_query": field("refined_query"),
                "entities": field("entities"),
                "sparql_query": field("sparql_query"),
                "validation": field("validation"),
                "context": field("context"),
            }),
        )])
    }

    fn on_result(&self, workflow: &mut Workflow, result: &TaskResult) -> Result<Vec<TaskSpec>, String> {
        if !result.success {
            return Err(format!("{} failed: {}", result.slave_type, result.error_message()));
        }
        if result.slave_type != SlaveType::ResponseGeneration {
            return Err(format!("response master cannot handle {} results", result.slave_type));
        }
        let response = required_field(result, "response")?;
        workflow.data.insert("response".to_string(), response);
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_passes_upstream_outputs() {
        let mut wf = Workflow::new("q", Value::Null);
        wf.data.insert("sparql_query".into(), json!("SELECT * {}"));
        wf.data.insert("validation".into(), json!({"valid": false}));
        let tasks = ResponseLogic.start(&wf).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].parameters["sparql_query"], "SELECT * {}");
        assert_eq!(tasks[0].parameters["validation"]["valid"], false);
    }

    #[test]
    fn test_response_stored() {
        let mut wf = Workflow::new("q", Value::Null);
        let result = TaskResult {
            success: true,
            result: Some(json!({"response": "42 genes"})),
            error: None,
            request_id: wf.request_id.clone(),
            task_id: format!("{}_response_generation", wf.request_id),
            domain: Domain::Response,
            slave_type: SlaveType::ResponseGeneration,
            execution_time: 0.1,
        };
        assert!(ResponseLogic.on_result(&mut wf, &result).unwrap().is_empty());
        assert_eq!(wf.data["response"], "42 genes");
    }
}
