//! Orchestrator configuration.
//!
//! `OrchestrationConfig` is the top-level `cortex.toml`. Every field has a
//! default so an empty file (or no file) is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::AgentSelectionStrategy;

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Executions allowed to run at once (0 = unlimited).
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: u32,

    /// Deadline for executions whose workflow sets no `timeout_ms`.
    #[serde(default = "default_workflow_timeout_secs")]
    pub default_workflow_timeout_secs: u64,

    /// Per-attempt timeout for tasks with no timeout of their own.
    #[serde(default = "default_task_timeout_secs")]
    pub default_task_timeout_secs: u64,

    /// Strategy used when a task's selector does not name one.
    #[serde(default)]
    pub task_distribution_strategy: AgentSelectionStrategy,

    /// Capacity of the broadcast event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Worker tasks draining the event dispatch queue.
    #[serde(default = "default_event_workers")]
    pub event_workers: usize,

    /// Bounded length of the event dispatch queue.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

fn default_max_concurrent_workflows() -> u32 {
    100
}

fn default_workflow_timeout_secs() -> u64 {
    1800
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_event_bus_capacity() -> usize {
    1024
}

fn default_event_workers() -> usize {
    4
}

fn default_event_queue_capacity() -> usize {
    256
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: default_max_concurrent_workflows(),
            default_workflow_timeout_secs: default_workflow_timeout_secs(),
            default_task_timeout_secs: default_task_timeout_secs(),
            task_distribution_strategy: AgentSelectionStrategy::default(),
            event_bus_capacity: default_event_bus_capacity(),
            event_workers: default_event_workers(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl OrchestrationConfig {
    pub fn default_workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.default_workflow_timeout_secs)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }
}
