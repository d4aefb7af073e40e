//! Workflow orchestration: definitions, planning, and execution.
//!
//! - `definition` -- YAML/JSON parsing and structural validation
//! - `graph` -- dependency graph, cycle detection, batch leveling
//! - `condition` -- task condition evaluation (JEXL for expressions)
//! - `retry` -- retry decisions and exponential backoff
//! - `executor` -- single-task executor with per-attempt timeout
//! - `scheduler` -- batch scheduler with barrier and failure policy
//! - `control` -- per-run cancellation token and pause gate
//! - `registry` -- live execution registry
//! - `engine` -- `WorkflowEngine` facade

pub mod condition;
pub mod control;
pub mod definition;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod registry;
pub mod retry;
pub mod scheduler;

pub use engine::{EngineError, ExecutionRequest, WorkflowEngine};
pub use graph::{DependencyGraph, GraphError, GraphInfo};
pub use scheduler::{BatchError, BatchScheduler, SchedulerError};
