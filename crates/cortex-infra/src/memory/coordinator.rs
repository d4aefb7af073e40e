//! Local in-process `AgentCoordinator`.
//!
//! Agents are registered up front with a load record each. Selection uses the
//! shared filter/strategy functions from `cortex-core`; assignment checks
//! health and capacity, bumps the agent's load for the duration of the call,
//! and hands the task to a pluggable `TaskHandler`.
//!
//! Handlers use the same blanket-impl pattern as event handlers:
//! 1. `TaskHandler` uses native async fn in traits
//! 2. `TaskHandlerDyn` is the object-safe version with boxed futures
//! 3. Every `TaskHandler` is automatically a `TaskHandlerDyn`

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use chrono::Utc;
use cortex_core::agent::selector::{Candidate, filter_candidates, select_by_strategy};
use cortex_core::agent::{AgentCoordinator, TaskAssignment};
use cortex_types::agent::{Agent, AgentLoad, AgentSelectionStrategy, AgentSelector, TaskResult};
use cortex_types::error::AgentError;
use cortex_types::execution::ResourceUsage;
use cortex_types::value::{ContextValue, ValueMap};
use cortex_types::workflow::WorkflowTask;
use dashmap::DashMap;

/// Default per-agent concurrent task capacity.
pub const DEFAULT_MAX_TASKS_PER_AGENT: u32 = 10;

/// Default minimum health score for assignment.
pub const DEFAULT_HEALTH_THRESHOLD: f64 = 0.7;

// ---------------------------------------------------------------------------
// Task handlers
// ---------------------------------------------------------------------------

/// Performs the actual work of a task on behalf of an agent.
pub trait TaskHandler: Send + Sync + 'static {
    fn handle(
        &self,
        agent: &Agent,
        task: &WorkflowTask,
        assignment: &TaskAssignment,
    ) -> impl Future<Output = Result<TaskResult, AgentError>> + Send;
}

/// Object-safe version of [`TaskHandler`] with boxed futures.
pub trait TaskHandlerDyn: Send + Sync {
    fn handle_boxed<'a>(
        &'a self,
        agent: &'a Agent,
        task: &'a WorkflowTask,
        assignment: &'a TaskAssignment,
    ) -> Pin<Box<dyn Future<Output = Result<TaskResult, AgentError>> + Send + 'a>>;
}

impl<T: TaskHandler> TaskHandlerDyn for T {
    fn handle_boxed<'a>(
        &'a self,
        agent: &'a Agent,
        task: &'a WorkflowTask,
        assignment: &'a TaskAssignment,
    ) -> Pin<Box<dyn Future<Output = Result<TaskResult, AgentError>> + Send + 'a>> {
        Box::pin(self.handle(agent, task, assignment))
    }
}

/// Simulates work: sleeps for the task's `estimated_duration_ms` and echoes
/// the task's identity and parameters as output.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl TaskHandler for EchoHandler {
    async fn handle(
        &self,
        agent: &Agent,
        task: &WorkflowTask,
        assignment: &TaskAssignment,
    ) -> Result<TaskResult, AgentError> {
        if let Some(ms) = task.resources.estimated_duration_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        let mut output = ValueMap::new();
        output.insert("task_type".into(), ContextValue::from(task.task_type.as_str()));
        output.insert("agent_id".into(), ContextValue::from(agent.id.as_str()));
        output.insert("attempt".into(), ContextValue::from(assignment.attempt));
        if !task.parameters.is_empty() {
            output.insert("parameters".into(), ContextValue::Map(task.parameters.clone()));
        }

        Ok(TaskResult {
            output,
            resource_usage: ResourceUsage {
                cpu: task.resources.cpu,
                memory: task.resources.memory,
                ..ResourceUsage::default()
            },
            logs: vec![format!("{} handled by {}", task.id, agent.id)],
        })
    }
}

// ---------------------------------------------------------------------------
// Load analysis
// ---------------------------------------------------------------------------

/// Result of comparing each agent's load to the pool average.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub average_tasks: f64,
    /// Agents above 1.5x the average.
    pub overloaded: Vec<String>,
    /// Agents below 0.5x the average.
    pub underutilized: Vec<String>,
}

// ---------------------------------------------------------------------------
// LocalAgentCoordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RegisteredAgent {
    agent: Agent,
    load: AgentLoad,
}

/// In-process agent pool.
pub struct LocalAgentCoordinator {
    agents: DashMap<String, RegisteredAgent>,
    handler: Arc<dyn TaskHandlerDyn>,
    max_tasks_per_agent: u32,
    health_threshold: f64,
    default_strategy: AgentSelectionStrategy,
    cursor: AtomicUsize,
}

impl LocalAgentCoordinator {
    pub fn new(handler: Arc<dyn TaskHandlerDyn>) -> Self {
        Self {
            agents: DashMap::new(),
            handler,
            max_tasks_per_agent: DEFAULT_MAX_TASKS_PER_AGENT,
            health_threshold: DEFAULT_HEALTH_THRESHOLD,
            default_strategy: AgentSelectionStrategy::default(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Pool of `count` generic agents (`agent-1` .. `agent-N`) running [`EchoHandler`].
    pub fn with_echo_agents(count: usize) -> Self {
        let coordinator = Self::new(Arc::new(EchoHandler));
        for n in 1..=count {
            coordinator.register(Agent::new(format!("agent-{n}")));
        }
        coordinator
    }

    pub fn with_max_tasks_per_agent(mut self, max: u32) -> Self {
        self.max_tasks_per_agent = max.max(1);
        self
    }

    pub fn with_health_threshold(mut self, threshold: f64) -> Self {
        self.health_threshold = threshold;
        self
    }

    pub fn with_default_strategy(mut self, strategy: AgentSelectionStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Add (or replace) an agent with an idle load record.
    pub fn register(&self, agent: Agent) {
        let mut load = AgentLoad::idle(agent.id.clone());
        load.capabilities = agent.capabilities.clone();
        tracing::debug!(agent_id = agent.id.as_str(), "agent registered");
        self.agents.insert(agent.id.clone(), RegisteredAgent { agent, load });
    }

    pub fn deregister(&self, agent_id: &str) -> bool {
        self.agents.remove(agent_id).is_some()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Override an agent's health score (clamped to `[0, 1]`).
    pub fn set_health(&self, agent_id: &str, score: f64) -> Result<(), AgentError> {
        let mut entry = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| AgentError::UnknownAgent(agent_id.to_string()))?;
        entry.load.health_score = score.clamp(0.0, 1.0);
        entry.load.last_updated = Utc::now();
        Ok(())
    }

    /// Compare each agent's task count to the pool average.
    pub fn analyze_load(&self) -> LoadReport {
        let loads = self.snapshot();
        if loads.is_empty() {
            return LoadReport::default();
        }

        let average_tasks =
            loads.iter().map(|c| c.load.total_tasks() as f64).sum::<f64>() / loads.len() as f64;
        let mut report = LoadReport {
            average_tasks,
            ..LoadReport::default()
        };
        if average_tasks == 0.0 {
            return report;
        }

        for c in &loads {
            let tasks = c.load.total_tasks() as f64;
            if tasks > average_tasks * 1.5 {
                report.overloaded.push(c.agent.id.clone());
            } else if tasks < average_tasks * 0.5 {
                report.underutilized.push(c.agent.id.clone());
            }
        }
        report
    }

    /// Every agent with its load, sorted by id.
    fn snapshot(&self) -> Vec<Candidate> {
        let mut all: Vec<Candidate> = self
            .agents
            .iter()
            .map(|entry| Candidate::new(entry.agent.clone(), entry.load.clone()))
            .collect();
        all.sort_by(|a, b| a.agent.id.cmp(&b.agent.id));
        all
    }

    fn has_capacity(&self, load: &AgentLoad) -> bool {
        load.total_tasks() < self.max_tasks_per_agent
    }

    /// Reserve a slot on `agent_id`, checking health and capacity atomically.
    fn reserve(&self, agent_id: &str, task: &WorkflowTask) -> Result<(Agent, LoadGuard<'_>), AgentError> {
        let mut entry = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| AgentError::UnknownAgent(agent_id.to_string()))?;

        if entry.load.health_score < self.health_threshold {
            return Err(AgentError::Unhealthy {
                agent_id: agent_id.to_string(),
                score: entry.load.health_score,
                threshold: self.health_threshold,
            });
        }
        if !self.has_capacity(&entry.load) {
            return Err(AgentError::AtCapacity {
                agent_id: agent_id.to_string(),
                max_tasks: self.max_tasks_per_agent,
            });
        }

        let max = self.max_tasks_per_agent as f64;
        entry.load.active_tasks += 1;
        entry.load.cpu_usage = (entry.load.active_tasks as f64 / max * 100.0).min(100.0);
        entry.load.memory_usage = entry.load.memory_usage.max(task.resources.memory as f64 / 1024.0 * 100.0).min(100.0);
        entry.load.last_updated = Utc::now();

        Ok((
            entry.agent.clone(),
            LoadGuard {
                agents: &self.agents,
                agent_id: agent_id.to_string(),
                max_tasks: self.max_tasks_per_agent,
            },
        ))
    }
}

impl std::fmt::Debug for LocalAgentCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAgentCoordinator")
            .field("agents", &self.agents.len())
            .field("max_tasks_per_agent", &self.max_tasks_per_agent)
            .field("health_threshold", &self.health_threshold)
            .finish()
    }
}

/// Releases an agent's reserved slot when the assignment ends, including
/// when the assignment future is dropped on timeout.
struct LoadGuard<'a> {
    agents: &'a DashMap<String, RegisteredAgent>,
    agent_id: String,
    max_tasks: u32,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut entry) = self.agents.get_mut(&self.agent_id) {
            entry.load.active_tasks = entry.load.active_tasks.saturating_sub(1);
            entry.load.cpu_usage = entry.load.active_tasks as f64 / self.max_tasks as f64 * 100.0;
            if entry.load.active_tasks == 0 {
                entry.load.memory_usage = 0.0;
            }
            entry.load.last_updated = Utc::now();
        }
    }
}

impl AgentCoordinator for LocalAgentCoordinator {
    async fn select_agents(&self, selector: &AgentSelector, count: usize) -> Result<Vec<Agent>, AgentError> {
        if self.agents.is_empty() {
            return Err(AgentError::NoAgents);
        }

        let candidates: Vec<Candidate> = filter_candidates(self.snapshot(), selector)
            .into_iter()
            .filter(|c| self.has_capacity(&c.load))
            .collect();
        if candidates.is_empty() {
            return Err(AgentError::NoMatchingAgents);
        }

        let strategy = selector.strategy.unwrap_or(self.default_strategy);
        let selected = select_by_strategy(candidates, strategy, count, &self.cursor);
        tracing::debug!(
            strategy = strategy.as_str(),
            requested = count,
            selected = selected.len(),
            "agents selected"
        );
        Ok(selected)
    }

    async fn assign_task(
        &self,
        agent_id: &str,
        task: &WorkflowTask,
        assignment: &TaskAssignment,
    ) -> Result<TaskResult, AgentError> {
        let (agent, _guard) = self.reserve(agent_id, task)?;
        tracing::debug!(
            execution_id = %assignment.execution_id,
            task_id = task.id.as_str(),
            agent_id,
            attempt = assignment.attempt,
            "task assigned"
        );
        self.handler.handle_boxed(&agent, task, assignment).await
    }

    async fn get_agent_load(&self, agent_id: &str) -> Result<AgentLoad, AgentError> {
        self.agents
            .get(agent_id)
            .map(|entry| entry.load.clone())
            .ok_or_else(|| AgentError::UnknownAgent(agent_id.to_string()))
    }

    async fn get_available_agents(&self) -> Result<Vec<Agent>, AgentError> {
        Ok(self
            .snapshot()
            .into_iter()
            .filter(|c| c.load.health_score >= self.health_threshold && self.has_capacity(&c.load))
            .map(|c| c.agent)
            .collect())
    }

    async fn rebalance_load(&self) -> Result<(), AgentError> {
        let report = self.analyze_load();
        for agent_id in &report.overloaded {
            tracing::info!(
                agent_id = agent_id.as_str(),
                average = report.average_tasks,
                "agent overloaded"
            );
        }
        for agent_id in &report.underutilized {
            tracing::info!(
                agent_id = agent_id.as_str(),
                average = report.average_tasks,
                "agent underutilized"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
