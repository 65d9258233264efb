//! NLP stage: refine the query, then extract entities from the refined text.

use serde_json::{json, Value};

use super::{required_field, DomainLogic, TaskSpec};
use crate::models::{Domain, SlaveType, TaskResult, Workflow};

pub struct NlpLogic;

impl DomainLogic for NlpLogic {
    fn domain(&self) -> Domain {
        Domain::Nlp
    }

    fn required(&self) -> &'static [SlaveType] {
        &[SlaveType::QueryRefinement, SlaveType::EntityRecognition]
    }

    fn start(&self, workflow: &Workflow) -> Result<Vec<TaskSpec>, String> {
        let query = workflow
            .query()
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| "workflow has no query".to_string())?;
        Ok(vec![TaskSpec::new(
            SlaveType::QueryRefinement,
            json!({ "query": query, "context": workflow.context() }),
        )])
    }

    fn on_result(&self, workflow: &mut Workflow, result: &TaskResult) -> Result<Vec<TaskSpec>, String> {
        if !result.success {
            return Err(format!("{} failed: {}", result.slave_type, result.error_message()));
        }
        match result.slave_type {
            SlaveType::QueryRefinement => {
                let refined = match required_field(result, "refined_query")? {
                    Value::String(text) => text,
                    other => return Err(format!("query_refinement returned non-text output: {}", other)),
                };
                workflow
                    .data
                    .insert("refined_query".to_string(), Value::String(refined.clone()));
                Ok(vec![TaskSpec::new(
                    SlaveType::EntityRecognition,
                    json!({ "text": refined, "context": workflow.context() }),
                )])
            }
            SlaveType::EntityRecognition => {
                let entities = required_field(result, "entities")?;
                workflow.data.insert("entities".to_string(), entities);
                Ok(Vec::new())
            }
            other => Err(format!("nlp master cannot handle {} results", other)),
        }
    }
}
