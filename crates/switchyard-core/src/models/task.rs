use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::domain::{Domain, SlaveType};

/// A unit of work sent to a slave pool. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub request_id: String,
    pub slave_type: SlaveType,
    #[serde(default)]
    pub parameters: Value,
}

impl Task {
    /// Task ids are `{requestId}_{slaveType}`, so a workflow has at most one
    /// task per slave type.
    pub fn new(request_id: &str, slave_type: SlaveType, parameters: Value) -> Self {
        Self {
            task_id: Self::id_for(request_id, slave_type),
            request_id: request_id.to_string(),
            slave_type,
            parameters,
        }
    }

    pub fn id_for(request_id: &str, slave_type: SlaveType) -> String {
        format!("{}_{}", request_id, slave_type.as_str())
    }
}

/// Outcome of one task execution, published on `domain:{domain}:results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub request_id: String,
    pub task_id: String,
    pub domain: Domain,
    pub slave_type: SlaveType,
    /// Seconds spent inside the slave.
    pub execution_time: f64,
}

impl TaskResult {
    /// Read `key` from an object result. A bare (non-object) result stands
    /// in for the field; an object without `key` yields `None`.
    pub fn field(&self, key: &str) -> Option<Value> {
        let result = self.result.as_ref()?;
        match result {
            Value::Object(map) => map.get(key).cloned(),
            other => Some(other.clone()),
        }
    }

    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| format!("{} failed without an error message", self.slave_type))
    }
}
