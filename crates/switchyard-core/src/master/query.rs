//! Query stage: ontology mapping → SPARQL construction → validation.
//!
//! Validation never fails the workflow. A failed or negative validation is
//! recorded under `data.validation` with `valid: false` and the workflow
//! proceeds to the response stage.

use serde_json::{json, Map, Value};

use super::{required_field, DomainLogic, TaskSpec};
use crate::models::{Domain, SlaveType, TaskResult, Workflow};

pub struct QueryLogic;

impl QueryLogic {
    /// Normalize a validation result into `{"valid": bool, ..}`. A verdict
    /// nested under `validation_result` wins over top-level fields, and a
    /// result without a boolean `valid` counts as invalid.
    fn validation_record(result: &TaskResult) -> Value {
        if !result.success {
            return json!({ "valid": false, "error": result.error_message() });
        }
        match result.result.clone() {
            Some(Value::Object(mut map)) => {
                if let Some(Value::Object(inner)) = map.remove("validation_result") {
                    map = inner;
                }
                let valid = map.get("valid").and_then(Value::as_bool).unwrap_or(false);
                map.insert("valid".to_string(), Value::Bool(valid));
                Value::Object(map)
            }
            Some(Value::Bool(valid)) => json!({ "valid": valid }),
            Some(other) => {
                let mut map = Map::new();
                map.insert("valid".to_string(), Value::Bool(false));
                map.insert("details".to_string(), other);
                Value::Object(map)
            }
            None => json!({ "valid": false, "error": "validation returned no verdict" }),
        }
    }
}

impl DomainLogic for QueryLogic {
    fn domain(&self) -> Domain {
        Domain::Query
    }

    fn required(&self) -> &'static [SlaveType] {
        &[
            SlaveType::OntologyMapping,
            SlaveType::SparqlConstruction,
            SlaveType::Validation,
        ]
    }

    fn start(&self, workflow: &Workflow) -> Result<Vec<TaskSpec>, String> {
        let entities = workflow
            .data
            .get("entities")
            .cloned()
            .ok_or_else(|| "workflow has no entities".to_string())?;
        Ok(vec![TaskSpec::new(
            SlaveType::OntologyMapping,
            json!({
                "entities": entities,
                "refined_query": workflow.data.get("refined_query").cloned().unwrap_or(Value::Null),
            }),
        )])
    }

    fn on_result(&self, workflow: &mut Workflow, result: &TaskResult) -> Result<Vec<TaskSpec>, String> {
        if result.slave_type == SlaveType::Validation {
            let record = Self::validation_record(result);
            if record["valid"] == Value::Bool(false) {
                tracing::warn!(
                    "[DomainMaster:query] Workflow {} failed validation, continuing",
                    workflow.request_id
                );
            }
            workflow.data.insert("validation".to_string(), record);
            return Ok(Vec::new());
        }
        if !result.success {
            return Err(format!("{} failed: {}", result.slave_type, result.error_message()));
        }
        match result.slave_type {
            SlaveType::OntologyMapping => {
                let mapped = required_field(result, "mapped_entities")?;
                workflow.data.insert("mapped_entities".to_string(), mapped.clone());
                Ok(vec![TaskSpec::new(
                    SlaveType::SparqlConstruction,
                    json!({
                        "mapped_entities": mapped,
                        "refined_query": workflow.data.get("refined_query").cloned().unwrap_or(Value::Null),
                    }),
                )])
            }
            SlaveType::SparqlConstruction => {
                let sparql = required_field(result, "sparql_query")?;
                workflow.data.insert("sparql_query".to_string(), sparql.clone());
                Ok(vec![TaskSpec::new(
                    SlaveType::Validation,
                    json!({ "sparql_query": sparql }),
                )])
            }
            other => Err(format!("query master cannot handle {} results", other)),
        }
    }
}
