//! Switchyard CLI: command implementations behind the `switchyard` binary.
//!
//! Exposed as a library so integration tests can drive the same code paths
//! as the binary.

pub mod commands;
