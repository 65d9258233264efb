//! Slaves and the pools that run them.
//!
//! A [`Slave`] is a stateless task handler for one [`SlaveType`]. Concrete
//! handlers live outside this crate; [`echo`] provides deterministic
//! stand-ins for demos.
//!
//! [`SlaveType`]: crate::models::SlaveType

pub mod echo;
pub mod manager;
pub mod pool;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SlaveError;

pub use manager::{SlavePoolManager, SlaveRegistry};
pub use pool::SlavePool;

/// What a slave reports back for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SlaveOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait Slave: Send + Sync {
    /// Run one task. `Err` (or a panic) is reported as a failed result.
    async fn execute_task(&self, parameters: &Value) -> Result<SlaveOutcome, SlaveError>;

    fn report_status(&self) -> Value {
        Value::Object(Default::default())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Builds a fresh slave. Pools call it on start, scale-up, and replacement.
pub type SlaveFactory = Arc<dyn Fn() -> Result<Arc<dyn Slave>, SlaveError> + Send + Sync>;
