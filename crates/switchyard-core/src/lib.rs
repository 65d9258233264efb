//! Switchyard Core: transport-agnostic workflow orchestration.
//!
//! A workflow is routed through a fixed pipeline of domains (`nlp` → `query`
//! → `response`). Each domain is owned by a [`master::DomainMaster`] that fans
//! sub-tasks out to auto-scaling [`slaves::pool::SlavePool`]s over a shared
//! pub/sub substrate ([`store::SharedStore`]). The [`master::global::GlobalMaster`]
//! is the entry point: it creates workflows, guards dispatch with per-domain
//! circuit breakers, and finalizes workflows on `global:completions`.
//!
//! The crate ships an in-process [`store::MemoryStore`], so the full pipeline
//! can run inside a single tokio runtime (see [`runtime::Switchyard`]).

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod health;
pub mod load_balancer;
pub mod master;
pub mod metrics;
pub mod models;
pub mod runtime;
pub mod slaves;
pub mod store;

// Convenience re-exports
pub use config::SwitchyardConfig;
pub use error::{OrchestratorError, SlaveError, StoreError};
pub use runtime::Switchyard;
pub use store::{DynStore, MemoryStore, SharedStore};
