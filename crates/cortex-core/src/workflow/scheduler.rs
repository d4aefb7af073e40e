//! Batch scheduler: runs a workflow as a static sequence of dependency batches.
//!
//! The plan is computed once from the dependency graph. Every task in a batch
//! runs on its own tokio task; the batch ends at a barrier that waits for all
//! of them. Task workers write only to their own `TaskExecution` entry and
//! report failures back over a single bounded channel, which the run loop
//! drains after the barrier before applying the failure policy.
//!
//! # Run flow
//!
//! 1. Build the graph, validate acyclicity, compute batches.
//! 2. For each batch: wait on the pause gate, evaluate conditions, launch
//!    workers, join at the barrier.
//! 3. Merge completed outputs into the context under the task id.
//! 4. Apply the failure policy, then check for cancellation.
//!
//! The whole run is bounded by the workflow deadline. Dropping the run on
//! timeout drops the `JoinSet`, which aborts any attempt still in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use cortex_types::agent::{AgentSelectionStrategy, AgentSelector};
use cortex_types::config::OrchestrationConfig;
use cortex_types::event::ExecutionEvent;
use cortex_types::execution::TaskStatus;
use cortex_types::value::{ContextValue, ValueMap};
use cortex_types::workflow::{FailureAction, FailurePolicy, Workflow, WorkflowTask};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use uuid::Uuid;

use super::condition::ConditionEvaluator;
use super::control::RunControl;
use super::executor::{TaskExecutionError, TaskExecutor, TaskRequest, TaskSlot};
use super::graph::{DependencyGraph, GraphError};
use super::registry::SharedExecution;
use crate::agent::{AgentCoordinator, TaskAssignment};
use crate::event::EventBus;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// One failed task inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task_id: String,
    pub message: String,
}

/// Every task failure collected at one batch barrier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("batch {batch_index} had {} failed task(s): {}", .failures.len(), summarize(.failures))]
pub struct BatchError {
    pub batch_index: usize,
    pub failures: Vec<TaskFailure>,
}

fn summarize(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.task_id, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("workflow timed out after {}s", .0.as_secs())]
    WorkflowTimeout(Duration),
}

// ---------------------------------------------------------------------------
// Run inputs and outputs
// ---------------------------------------------------------------------------

/// Everything the scheduler needs to drive one execution.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub execution_id: Uuid,
    pub workflow: Arc<Workflow>,
    pub state: SharedExecution,
    pub control: RunControl,
}

/// How a run that did not error ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every batch ran. `failed_tasks` is non-zero only under `continue`.
    Completed { failed_tasks: u32 },
    Cancelled,
}

// ---------------------------------------------------------------------------
// BatchScheduler
// ---------------------------------------------------------------------------

pub struct BatchScheduler<C> {
    coordinator: Arc<C>,
    executor: TaskExecutor<C>,
    events: EventBus,
    conditions: ConditionEvaluator,
    default_strategy: AgentSelectionStrategy,
    default_task_timeout: Duration,
    default_workflow_timeout: Duration,
}

impl<C: AgentCoordinator> BatchScheduler<C> {
    pub fn new(coordinator: Arc<C>, events: EventBus, config: &OrchestrationConfig) -> Self {
        Self {
            executor: TaskExecutor::new(coordinator.clone(), events.clone()),
            coordinator,
            events,
            conditions: ConditionEvaluator::new(),
            default_strategy: config.task_distribution_strategy,
            default_task_timeout: config.default_task_timeout(),
            default_workflow_timeout: config.default_workflow_timeout(),
        }
    }

    /// Deadline for the whole run: the workflow's own, else the configured default.
    pub fn workflow_timeout(&self, workflow: &Workflow) -> Duration {
        workflow
            .configuration
            .timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(self.default_workflow_timeout)
    }

    /// Per-attempt deadline for `task`.
    pub fn task_timeout(&self, workflow: &Workflow, task: &WorkflowTask) -> Duration {
        task.timeout_ms
            .filter(|ms| *ms > 0)
            .or(workflow.configuration.default_timeout_ms.filter(|ms| *ms > 0))
            .map(Duration::from_millis)
            .unwrap_or(self.default_task_timeout)
    }

    /// Run every batch of `run.workflow`.
    ///
    /// Graph errors surface before any task starts. A `BatchError` means the
    /// failure policy aborted the run.
    pub async fn run(&self, run: &RunContext) -> Result<RunOutcome, SchedulerError> {
        let graph = DependencyGraph::from_workflow(&run.workflow)?;
        graph.validate_acyclic()?;
        let batches = graph.get_execution_batches()?;

        let deadline = self.workflow_timeout(&run.workflow);
        tracing::debug!(
            execution_id = %run.execution_id,
            batches = batches.len(),
            timeout_ms = deadline.as_millis() as u64,
            "execution plan ready"
        );

        match tokio::time::timeout(deadline, self.run_batches(run, &batches)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    execution_id = %run.execution_id,
                    timeout_ms = deadline.as_millis() as u64,
                    "workflow deadline exceeded"
                );
                Err(SchedulerError::WorkflowTimeout(deadline))
            }
        }
    }

    async fn run_batches(
        &self,
        run: &RunContext,
        batches: &[Vec<String>],
    ) -> Result<RunOutcome, SchedulerError> {
        let policy = &run.workflow.configuration.failure_policy;
        let mut failed_total: u32 = 0;

        for (batch_index, batch) in batches.iter().enumerate() {
            if run.control.is_cancelled() || !run.control.wait_while_paused().await {
                tracing::info!(
                    execution_id = %run.execution_id,
                    batch = batch_index,
                    "execution cancelled before batch"
                );
                return Ok(RunOutcome::Cancelled);
            }

            let failures = self.run_batch(run, batch_index, batch).await;

            if run.control.is_cancelled() {
                tracing::info!(
                    execution_id = %run.execution_id,
                    batch = batch_index,
                    "execution cancelled during batch"
                );
                return Ok(RunOutcome::Cancelled);
            }

            if failures.is_empty() {
                continue;
            }
            failed_total += failures.len() as u32;
            let error = BatchError {
                batch_index,
                failures,
            };

            if should_abort(policy, &error, failed_total) {
                tracing::error!(
                    execution_id = %run.execution_id,
                    batch = batch_index,
                    policy = policy.on_task_failure.as_str(),
                    error = %error,
                    "aborting execution after failed batch"
                );
                return Err(error.into());
            }
            tracing::warn!(
                execution_id = %run.execution_id,
                batch = batch_index,
                failed_total,
                error = %error,
                "continuing past failed batch"
            );
        }

        Ok(RunOutcome::Completed {
            failed_tasks: failed_total,
        })
    }

    /// Launch one batch and wait at its barrier. Returns the batch's failures.
    async fn run_batch(&self, run: &RunContext, batch_index: usize, batch: &[String]) -> Vec<TaskFailure> {
        let context = run.state.read().await.context.clone();

        let mut tasks: Vec<&WorkflowTask> = batch
            .iter()
            .filter_map(|id| run.workflow.task(id))
            .collect();
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

        self.events.publish(ExecutionEvent::BatchStarted {
            execution_id: run.execution_id,
            batch_index,
            task_ids: tasks.iter().map(|t| t.id.clone()).collect(),
        });
        tracing::debug!(
            execution_id = %run.execution_id,
            batch = batch_index,
            tasks = tasks.len(),
            "starting batch"
        );

        let (reports, mut failures_rx) = mpsc::channel::<TaskFailure>(tasks.len().max(1));
        let max_concurrent = run.workflow.configuration.max_concurrent_tasks;
        let limiter = (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent as usize)));
        let gauge = ConcurrencyGauge::default();

        let mut join_set = JoinSet::new();
        let mut launched: HashMap<tokio::task::Id, String> = HashMap::new();

        for task in tasks {
            let slot = TaskSlot::new(run.state.clone(), task.id.clone());

            match self.conditions.evaluate_all(&task.conditions, &context) {
                Ok(true) => {}
                Ok(false) => {
                    slot.update(|t| {
                        t.status = TaskStatus::Skipped;
                        t.end_time = Some(Utc::now());
                    })
                    .await;
                    self.events.publish(ExecutionEvent::TaskSkipped {
                        execution_id: run.execution_id,
                        task_id: task.id.clone(),
                    });
                    tracing::debug!(
                        execution_id = %run.execution_id,
                        task_id = task.id.as_str(),
                        "conditions not met, skipping task"
                    );
                    continue;
                }
                Err(e) => {
                    let error = TaskExecutionError::Condition(e.to_string());
                    record_failure(&slot, &self.events, run.execution_id, &error, &reports).await;
                    continue;
                }
            }

            let worker = TaskWorker {
                execution_id: run.execution_id,
                workflow_id: run.workflow.id.clone(),
                task: task.clone(),
                selector: self.selector_for(task),
                attempt_timeout: self.task_timeout(&run.workflow, task),
                context: context.clone(),
                slot,
                coordinator: self.coordinator.clone(),
                executor: self.executor.clone(),
                events: self.events.clone(),
                control: run.control.clone(),
                limiter: limiter.clone(),
                gauge: gauge.clone(),
                reports: reports.clone(),
            };
            let handle = join_set.spawn(worker.run());
            launched.insert(handle.id(), task.id.clone());
        }

        // Barrier.
        while let Some(joined) = join_set.join_next_with_id().await {
            let Err(join_error) = joined else { continue };
            let Some(task_id) = launched.get(&join_error.id()) else {
                continue;
            };
            tracing::error!(
                execution_id = %run.execution_id,
                task_id = task_id.as_str(),
                error = %join_error,
                "task worker did not finish"
            );
            let slot = TaskSlot::new(run.state.clone(), task_id.clone());
            let error = TaskExecutionError::Agent {
                attempt: slot.read(|t| t.map_or(0, |t| t.attempts)).await,
                message: format!("task worker aborted: {join_error}"),
            };
            record_failure(&slot, &self.events, run.execution_id, &error, &reports).await;
        }
        drop(reports);

        let mut failures = Vec::new();
        while let Some(failure) = failures_rx.recv().await {
            failures.push(failure);
        }

        self.merge_batch(run, batch, gauge.peak()).await;
        failures
    }

    /// Fold a finished batch into the execution record: outputs into the
    /// context, agents into `agents_used`, peak concurrency into metrics.
    async fn merge_batch(&self, run: &RunContext, batch: &[String], peak: u32) {
        let mut execution = run.state.write().await;

        let mut outputs: Vec<(String, ContextValue)> = Vec::new();
        let mut agents: Vec<String> = Vec::new();
        for id in batch {
            let Some(task) = execution.task_executions.get(id) else {
                continue;
            };
            if task.status == TaskStatus::Completed {
                outputs.push((id.clone(), ContextValue::Map(task.output.clone())));
            }
            if let Some(agent) = &task.agent_id {
                agents.push(agent.clone());
            }
        }

        execution.context.extend(outputs);
        for agent in &agents {
            execution.record_agent(agent);
        }
        execution.metrics.max_concurrent_tasks = execution.metrics.max_concurrent_tasks.max(peak);
        execution.refresh_metrics();
    }

    fn selector_for(&self, task: &WorkflowTask) -> AgentSelector {
        let mut selector = task.agent_selector.clone();
        selector.strategy.get_or_insert(self.default_strategy);
        selector
    }
}

/// Whether the failure policy ends the run after `error`.
///
/// `stop` and `retry_workflow` always abort. `continue` aborts only for a
/// critical task or once `max_failed_tasks` is reached.
fn should_abort(policy: &FailurePolicy, error: &BatchError, failed_total: u32) -> bool {
    match policy.on_task_failure {
        FailureAction::Stop | FailureAction::RetryWorkflow => true,
        FailureAction::Continue => {
            error
                .failures
                .iter()
                .any(|f| policy.critical_tasks.contains(&f.task_id))
                || (policy.max_failed_tasks > 0 && failed_total >= policy.max_failed_tasks)
        }
    }
}

// ---------------------------------------------------------------------------
// Task worker
// ---------------------------------------------------------------------------

/// Owned inputs for one task's tokio task.
struct TaskWorker<C> {
    execution_id: Uuid,
    workflow_id: String,
    task: WorkflowTask,
    selector: AgentSelector,
    attempt_timeout: Duration,
    context: ValueMap,
    slot: TaskSlot,
    coordinator: Arc<C>,
    executor: TaskExecutor<C>,
    events: EventBus,
    control: RunControl,
    limiter: Option<Arc<Semaphore>>,
    gauge: ConcurrencyGauge,
    reports: mpsc::Sender<TaskFailure>,
}

impl<C: AgentCoordinator> TaskWorker<C> {
    async fn run(self) {
        let agent = match self.coordinator.select_agents(&self.selector, 1).await {
            Ok(agents) => agents.into_iter().next().ok_or_else(|| "no agents selected".to_string()),
            Err(e) => Err(e.to_string()),
        };
        let agent = match agent {
            Ok(agent) => agent,
            Err(reason) => {
                let error = TaskExecutionError::NoAgentAvailable(reason);
                record_failure(&self.slot, &self.events, self.execution_id, &error, &self.reports).await;
                return;
            }
        };

        let queued_on = agent.id.clone();
        self.slot
            .update(|t| {
                t.status = TaskStatus::Queued;
                t.agent_id = Some(queued_on);
            })
            .await;

        let _permit = match &self.limiter {
            Some(limiter) => limiter.clone().acquire_owned().await.ok(),
            None => None,
        };
        let _in_flight = self.gauge.enter();

        let outcome = self
            .executor
            .execute(TaskRequest {
                task: &self.task,
                agent_id: &agent.id,
                attempt_timeout: self.attempt_timeout,
                assignment: TaskAssignment {
                    execution_id: self.execution_id,
                    workflow_id: self.workflow_id.clone(),
                    attempt: 0,
                    context: self.context.clone(),
                },
                slot: &self.slot,
                cancel: self.control.token(),
            })
            .await;

        match outcome {
            Ok(outcome) => {
                let attempts = outcome.attempts;
                let result = outcome.result;
                let finished = Utc::now();
                self.slot
                    .update(|t| {
                        t.status = TaskStatus::Completed;
                        t.attempts = attempts;
                        t.output = result.output;
                        t.resource_usage = result.resource_usage;
                        t.logs.extend(result.logs);
                        t.error = None;
                        t.mark_finished(finished);
                    })
                    .await;
                let duration_ms = self.slot.read(|t| t.and_then(|t| t.duration_ms).unwrap_or(0)).await;

                self.events.publish(ExecutionEvent::TaskCompleted {
                    execution_id: self.execution_id,
                    task_id: self.task.id.clone(),
                    attempts,
                    duration_ms,
                });
                tracing::debug!(
                    execution_id = %self.execution_id,
                    task_id = self.task.id.as_str(),
                    agent_id = agent.id.as_str(),
                    attempts,
                    duration_ms,
                    "task completed"
                );
            }
            Err(error) => {
                record_failure(&self.slot, &self.events, self.execution_id, &error, &self.reports).await;
            }
        }
    }
}

/// Mark the task `Failed`, publish the event, and report it to the run loop.
async fn record_failure(
    slot: &TaskSlot,
    events: &EventBus,
    execution_id: Uuid,
    error: &TaskExecutionError,
    reports: &mpsc::Sender<TaskFailure>,
) {
    let message = error.to_string();
    let finished = Utc::now();
    let recorded = message.clone();
    slot.update(|t| {
        t.status = TaskStatus::Failed;
        t.error = Some(recorded);
        if error.attempts() > 0 {
            t.attempts = error.attempts();
        }
        t.mark_finished(finished);
    })
    .await;
    let attempts = slot.read(|t| t.map_or(0, |t| t.attempts)).await;

    events.publish(ExecutionEvent::TaskFailed {
        execution_id,
        task_id: slot.task_id().to_string(),
        attempts,
        error: message.clone(),
    });
    tracing::warn!(
        execution_id = %execution_id,
        task_id = slot.task_id(),
        attempts,
        error = message.as_str(),
        "task failed"
    );

    let failure = TaskFailure {
        task_id: slot.task_id().to_string(),
        message,
    };
    if reports.send(failure).await.is_err() {
        tracing::error!(execution_id = %execution_id, task_id = slot.task_id(), "failure report dropped");
    }
}

// ---------------------------------------------------------------------------
// Concurrency gauge
// ---------------------------------------------------------------------------

/// Counts attempts in flight within a batch and remembers the peak.
#[derive(Debug, Clone, Default)]
struct ConcurrencyGauge {
    current: Arc<AtomicU32>,
    peak: Arc<AtomicU32>,
}

impl ConcurrencyGauge {
    fn enter(&self) -> GaugeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard {
            current: self.current.clone(),
        }
    }

    fn peak(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }
}

struct GaugeGuard {
    current: Arc<AtomicU32>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
