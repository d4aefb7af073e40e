//! Shared domain types for Cortex.
//!
//! Workflow definitions, execution records, agent descriptors, execution
//! events, orchestration configuration, and their error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod value;
pub mod workflow;
