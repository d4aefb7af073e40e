//! Agent coordinator trait definition.

use cortex_types::agent::{Agent, AgentLoad, AgentSelector, TaskResult};
use cortex_types::error::AgentError;
use cortex_types::value::ValueMap;
use cortex_types::workflow::WorkflowTask;
use uuid::Uuid;

/// Execution-side information handed to an agent with each attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskAssignment {
    pub execution_id: Uuid,
    pub workflow_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Snapshot of the execution context when the batch started.
    pub context: ValueMap,
}

/// Chooses agents and hands them tasks.
///
/// Implementations live in cortex-infra (e.g., `LocalAgentCoordinator`).
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait AgentCoordinator: Send + Sync + 'static {
    /// Pick up to `count` agents that satisfy `selector`, best candidate first.
    ///
    /// `selector.strategy` is always set by the time the scheduler calls this.
    fn select_agents(
        &self,
        selector: &AgentSelector,
        count: usize,
    ) -> impl std::future::Future<Output = Result<Vec<Agent>, AgentError>> + Send;

    /// Run one attempt of `task` on `agent_id` and wait for its result.
    fn assign_task(
        &self,
        agent_id: &str,
        task: &WorkflowTask,
        assignment: &TaskAssignment,
    ) -> impl std::future::Future<Output = Result<TaskResult, AgentError>> + Send;

    /// Current load snapshot for one agent.
    fn get_agent_load(
        &self,
        agent_id: &str,
    ) -> impl std::future::Future<Output = Result<AgentLoad, AgentError>> + Send;

    /// Every agent currently registered and healthy.
    fn get_available_agents(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Agent>, AgentError>> + Send;

    /// Analyse load distribution and move work where possible.
    fn rebalance_load(&self) -> impl std::future::Future<Output = Result<(), AgentError>> + Send;
}
