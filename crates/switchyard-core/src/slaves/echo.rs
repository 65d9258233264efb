//! Deterministic stand-in slaves.
//!
//! They derive plausible outputs from their input text so the whole pipeline
//! can run without any NLP or SPARQL backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::manager::SlaveRegistry;
use super::{Slave, SlaveOutcome};
use crate::error::SlaveError;
use crate::models::SlaveType;

const ONTOLOGY_BASE: &str = "http://switchyard.local/ontology#";

pub struct EchoSlave {
    slave_type: SlaveType,
    delay: Duration,
    executed: AtomicU64,
}

impl EchoSlave {
    pub fn new(slave_type: SlaveType, delay: Duration) -> Self {
        Self {
            slave_type,
            delay,
            executed: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Slave for EchoSlave {
    async fn execute_task(&self, parameters: &Value) -> Result<SlaveOutcome, SlaveError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.executed.fetch_add(1, Ordering::Relaxed);
        let result = match self.slave_type {
            SlaveType::QueryRefinement => {
                let query = text_param(parameters, "query")?;
                json!({ "refined_query": query.split_whitespace().collect::<Vec<_>>().join(" ") })
            }
            SlaveType::EntityRecognition => {
                let text = text_param(parameters, "text")?;
                let entities: Vec<Value> = text
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| w.len() > 3)
                    .map(|w| json!({ "text": w, "label": "TERM" }))
                    .collect();
                json!({ "entities": entities })
            }
            SlaveType::OntologyMapping => {
                let entities = parameters
                    .get("entities")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let mapped: Vec<Value> = entities
                    .iter()
                    .filter_map(|e| e.get("text").and_then(Value::as_str))
                    .map(|t| json!({ "entity": t, "uri": format!("{}{}", ONTOLOGY_BASE, capitalize(t)) }))
                    .collect();
                json!({ "mapped_entities": mapped })
            }
            SlaveType::SparqlConstruction => {
                let mapped = parameters
                    .get("mapped_entities")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let patterns: Vec<String> = mapped
                    .iter()
                    .filter_map(|m| m.get("uri").and_then(Value::as_str))
                    .map(|uri| format!("?s ?p <{}> .", uri))
                    .collect();
                json!({ "sparql_query": format!("SELECT ?s WHERE {{ {} }}", patterns.join(" ")) })
            }
            SlaveType::Validation => {
                let sparql = text_param(parameters, "sparql_query")?;
                let valid = sparql.starts_with("SELECT") && sparql.contains('{');
                json!({ "valid": valid })
            }
            SlaveType::ResponseGeneration => {
                let query = parameters.get("query").and_then(Value::as_str).unwrap_or("");
                let sparql = parameters.get("sparql_query").and_then(Value::as_str).unwrap_or("");
                json!({ "response": format!("Answer for '{}' via: {}", query, sparql) })
            }
        };
        Ok(SlaveOutcome::ok(result))
    }

    fn report_status(&self) -> Value {
        json!({
            "kind": "echo",
            "slaveType": self.slave_type.as_str(),
            "executed": self.executed.load(Ordering::Relaxed),
        })
    }
}

fn text_param<'a>(parameters: &'a Value, key: &str) -> Result<&'a str, SlaveError> {
    parameters
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| SlaveError::InvalidParameters(format!("missing string parameter '{}'", key)))
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// A registry with an echo slave for every slave type.
pub fn registry(delay: Duration) -> SlaveRegistry {
    let mut registry = SlaveRegistry::new();
    for slave_type in SlaveType::ALL {
        registry.register_fn(slave_type, move || {
            Ok(Arc::new(EchoSlave::new(slave_type, delay)) as Arc<dyn Slave>)
        });
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(slave_type: SlaveType, parameters: Value) -> Value {
        let slave = EchoSlave::new(slave_type, Duration::ZERO);
        let outcome = slave.execute_task(&parameters).await.unwrap();
        assert!(outcome.success);
        outcome.result.unwrap()
    }

    #[tokio::test]
    async fn test_chain_produces_valid_sparql() {
        let refined = run(SlaveType::QueryRefinement, json!({"query": "  proteins   in liver "})).await;
        assert_eq!(refined["refined_query"], "proteins in liver");

        let entities = run(SlaveType::EntityRecognition, json!({"text": refined["refined_query"]})).await;
        assert_eq!(entities["entities"].as_array().unwrap().len(), 2);

        let mapped = run(SlaveType::OntologyMapping, entities.clone()).await;
        assert_eq!(
            mapped["mapped_entities"][0]["uri"],
            "http://switchyard.local/ontology#Proteins"
        );

        let sparql = run(SlaveType::SparqlConstruction, mapped).await;
        let validation = run(SlaveType::Validation, sparql.clone()).await;
        assert_eq!(validation["valid"], true);
    }

    #[tokio::test]
    async fn test_missing_parameter_is_an_error() {
        let slave = EchoSlave::new(SlaveType::QueryRefinement, Duration::ZERO);
        let err = slave.execute_task(&json!({})).await.unwrap_err();
        assert!(matches!(err, SlaveError::InvalidParameters(_)));
    }
}
