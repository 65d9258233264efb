//! Data model shared by masters, pools, and the wire.

pub mod domain;
pub mod task;
pub mod workflow;

pub use domain::{Domain, SlaveType};
pub use task::{Task, TaskResult};
pub use workflow::{ErrorDetails, StepStatus, Workflow, WorkflowStatus, WorkflowStep};
