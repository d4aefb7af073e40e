//! Orchestration core for Cortex.
//!
//! Holds the dependency graph, the batch scheduler and task executor, the
//! `WorkflowEngine` facade, and the "ports" (collaborator traits) that the
//! infrastructure layer implements. It depends only on `cortex-types` --
//! never on `cortex-infra` or any storage/IO crate.

pub mod agent;
pub mod event;
pub mod monitor;
pub mod repository;
pub mod workflow;
