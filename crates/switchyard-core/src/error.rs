//! Error types for the orchestration layer.
//!
//! `OrchestratorError` is returned by every fallible master, pool, and
//! manager operation. `StoreError` and `SlaveError` describe failures of the
//! two external collaborators (the shared store and task handlers) and
//! convert into `OrchestratorError` with `?`.

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Slave error: {0}")]
    Slave(#[from] SlaveError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Circuit open for domain {0}")]
    CircuitOpen(String),

    #[error("Dispatch failed for workflow {request_id}: {reason}")]
    Dispatch { request_id: String, reason: String },

    #[error("Timed out waiting for workflow {0}")]
    Timeout(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures of the shared state / messaging substrate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

/// Failures raised by a slave. Any of these becomes a failed `TaskResult`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SlaveError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("slave construction failed: {0}")]
    Construction(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts() {
        let err: OrchestratorError = StoreError::Unavailable("connection refused".into()).into();
        assert_eq!(err.to_string(), "Store error: store unavailable: connection refused");
    }

    #[test]
    fn test_dispatch_error_message() {
        let err = OrchestratorError::Dispatch {
            request_id: "abc".into(),
            reason: "no subscribers".into(),
        };
        assert_eq!(err.to_string(), "Dispatch failed for workflow abc: no subscribers");
    }
}
