//! Single-task executor with per-attempt timeout and exponential backoff.
//!
//! `TaskExecutor` drives one task through `Running -> (Retrying -> Running)*`
//! until an attempt succeeds or the retry budget is spent. Each attempt is
//! bounded by its own deadline. The backoff sleep between attempts aborts
//! as soon as the run is cancelled.
//!
//! Terminal task status (`Completed` / `Failed`) is written by the caller;
//! the executor only records attempt progress and failure logs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cortex_types::agent::TaskResult;
use cortex_types::event::ExecutionEvent;
use cortex_types::execution::{TaskExecution, TaskStatus};
use cortex_types::workflow::WorkflowTask;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::registry::SharedExecution;
use super::retry::RetryHandler;
use crate::agent::{AgentCoordinator, TaskAssignment};
use crate::event::EventBus;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Why a task did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskExecutionError {
    #[error("attempt {attempt} timed out after {}ms", .timeout.as_millis())]
    Timeout { attempt: u32, timeout: Duration },

    #[error("attempt {attempt} failed: {message}")]
    Agent { attempt: u32, message: String },

    #[error("cancelled after attempt {attempt}")]
    Cancelled { attempt: u32 },

    /// Every allowed attempt failed.
    #[error("failed after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("non-retryable failure on attempt {attempt}: {last}")]
    NonRetryable { attempt: u32, last: String },

    #[error("no agent available: {0}")]
    NoAgentAvailable(String),

    #[error("condition evaluation failed: {0}")]
    Condition(String),
}

impl TaskExecutionError {
    /// Attempts consumed before this error was produced.
    pub fn attempts(&self) -> u32 {
        match self {
            TaskExecutionError::Timeout { attempt, .. }
            | TaskExecutionError::Agent { attempt, .. }
            | TaskExecutionError::Cancelled { attempt }
            | TaskExecutionError::NonRetryable { attempt, .. } => *attempt,
            TaskExecutionError::Exhausted { attempts, .. } => *attempts,
            TaskExecutionError::NoAgentAvailable(_) | TaskExecutionError::Condition(_) => 0,
        }
    }

    /// The underlying cause, without attempt bookkeeping. Retryable error
    /// signatures are matched against this.
    pub fn cause(&self) -> String {
        match self {
            TaskExecutionError::Timeout { timeout, .. } => {
                format!("timeout after {}ms", timeout.as_millis())
            }
            TaskExecutionError::Agent { message, .. } => message.clone(),
            TaskExecutionError::Cancelled { .. } => "cancelled".to_string(),
            TaskExecutionError::Exhausted { last, .. }
            | TaskExecutionError::NonRetryable { last, .. } => last.clone(),
            TaskExecutionError::NoAgentAvailable(reason)
            | TaskExecutionError::Condition(reason) => reason.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskSlot
// ---------------------------------------------------------------------------

/// Write handle onto one task's entry in the shared execution record.
///
/// A task only ever mutates its own `TaskExecution`; the lock is held for the
/// duration of the closure and nothing else.
#[derive(Debug, Clone)]
pub struct TaskSlot {
    state: SharedExecution,
    task_id: String,
}

impl TaskSlot {
    pub fn new(state: SharedExecution, task_id: impl Into<String>) -> Self {
        Self {
            state,
            task_id: task_id.into(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub async fn update(&self, f: impl FnOnce(&mut TaskExecution)) {
        let mut execution = self.state.write().await;
        if let Some(task) = execution.task_executions.get_mut(&self.task_id) {
            f(task);
        }
    }

    pub async fn read<T>(&self, f: impl FnOnce(Option<&TaskExecution>) -> T) -> T {
        let execution = self.state.read().await;
        f(execution.task_executions.get(&self.task_id))
    }
}

// ---------------------------------------------------------------------------
// TaskExecutor
// ---------------------------------------------------------------------------

/// Inputs for one `TaskExecutor::execute` call.
#[derive(Debug)]
pub struct TaskRequest<'a> {
    pub task: &'a WorkflowTask,
    pub agent_id: &'a str,
    /// Per-attempt deadline.
    pub attempt_timeout: Duration,
    /// Template for each attempt; `attempt` is overwritten per try.
    pub assignment: TaskAssignment,
    pub slot: &'a TaskSlot,
    pub cancel: &'a CancellationToken,
}

/// Successful task result.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub result: TaskResult,
    pub attempts: u32,
}

/// Runs one task against an agent with retries.
pub struct TaskExecutor<C> {
    coordinator: Arc<C>,
    events: EventBus,
}

impl<C> Clone for TaskExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            events: self.events.clone(),
        }
    }
}

impl<C: AgentCoordinator> TaskExecutor<C> {
    pub fn new(coordinator: Arc<C>, events: EventBus) -> Self {
        Self {
            coordinator,
            events,
        }
    }

    /// Run attempts until one succeeds, the budget is spent, the error is
    /// not retryable, or the run is cancelled during backoff.
    pub async fn execute(&self, request: TaskRequest<'_>) -> Result<TaskOutcome, TaskExecutionError> {
        let TaskRequest {
            task,
            agent_id,
            attempt_timeout,
            mut assignment,
            slot,
            cancel,
        } = request;
        let policy = &task.retry_policy;
        let max_attempts = policy.effective_max_attempts();
        let execution_id = assignment.execution_id;

        let mut attempt = 1;
        loop {
            let agent = agent_id.to_string();
            slot.update(|t| {
                t.status = TaskStatus::Running;
                t.attempts = attempt;
                t.agent_id = Some(agent);
                t.start_time.get_or_insert_with(Utc::now);
            })
            .await;
            self.events.publish(ExecutionEvent::TaskStarted {
                execution_id,
                task_id: task.id.clone(),
                agent_id: agent_id.to_string(),
                attempt,
            });
            tracing::debug!(
                execution_id = %execution_id,
                task_id = task.id.as_str(),
                agent_id,
                attempt,
                "starting task attempt"
            );

            assignment.attempt = attempt;
            let run = self.coordinator.assign_task(agent_id, task, &assignment);
            let error = match tokio::time::timeout(attempt_timeout, run).await {
                Ok(Ok(result)) => {
                    return Ok(TaskOutcome {
                        result,
                        attempts: attempt,
                    });
                }
                Ok(Err(e)) => TaskExecutionError::Agent {
                    attempt,
                    message: e.to_string(),
                },
                Err(_) => TaskExecutionError::Timeout {
                    attempt,
                    timeout: attempt_timeout,
                },
            };

            let cause = error.cause();
            slot.update(|t| t.logs.push(format!("attempt {attempt} failed: {cause}")))
                .await;
            tracing::warn!(
                execution_id = %execution_id,
                task_id = task.id.as_str(),
                attempt,
                max_attempts,
                error = %error,
                "task attempt failed"
            );

            if attempt >= max_attempts {
                return Err(TaskExecutionError::Exhausted {
                    attempts: attempt,
                    last: cause,
                });
            }
            if !RetryHandler::should_retry(policy, attempt, &cause) {
                return Err(TaskExecutionError::NonRetryable {
                    attempt,
                    last: cause,
                });
            }

            let delay = RetryHandler::backoff_delay(policy, attempt);
            slot.update(|t| t.status = TaskStatus::Retrying).await;
            self.events.publish(ExecutionEvent::TaskRetrying {
                execution_id,
                task_id: task.id.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: cause,
            });

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(
                        execution_id = %execution_id,
                        task_id = task.id.as_str(),
                        attempt,
                        "retry backoff interrupted by cancellation"
                    );
                    return Err(TaskExecutionError::Cancelled { attempt });
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use cortex_types::agent::{Agent, AgentLoad, AgentSelector};
    use cortex_types::error::AgentError;
    use cortex_types::value::{ContextValue, ValueMap};
    use cortex_types::execution::WorkflowExecution;
    use cortex_types::workflow::{RetryPolicy, Workflow};
    use tokio::sync::RwLock;
    use tokio::time::Instant;

    /// Fails the first `failures` calls, then succeeds. Records call instants.
    struct Flaky {
        failures: u32,
        error: String,
        hang: bool,
        calls: Mutex<Vec<Instant>>,
    }

    impl Flaky {
        fn new(failures: u32, error: &str) -> Self {
            Self {
                failures,
                error: error.to_string(),
                hang: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn hanging() -> Self {
            Self {
                hang: true,
                ..Self::new(0, "")
            }
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl AgentCoordinator for Flaky {
        async fn select_agents(&self, _s: &AgentSelector, _n: usize) -> Result<Vec<Agent>, AgentError> {
            Ok(vec![Agent::new("agent-1")])
        }

        async fn assign_task(
            &self,
            _agent_id: &str,
            _task: &WorkflowTask,
            assignment: &TaskAssignment,
        ) -> Result<TaskResult, AgentError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(Instant::now());
                calls.len() as u32
            };
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if n <= self.failures {
                return Err(AgentError::Execution(self.error.clone()));
            }
            let mut output = ValueMap::new();
            output.insert("attempt".into(), ContextValue::from(assignment.attempt));
            Ok(TaskResult {
                output,
                ..TaskResult::default()
            })
        }

        async fn get_agent_load(&self, agent_id: &str) -> Result<AgentLoad, AgentError> {
            Ok(AgentLoad::idle(agent_id))
        }

        async fn get_available_agents(&self) -> Result<Vec<Agent>, AgentError> {
            Ok(vec![Agent::new("agent-1")])
        }

        async fn rebalance_load(&self) -> Result<(), AgentError> {
            Ok(())
        }
    }

    fn fixture(task: WorkflowTask) -> (TaskSlot, TaskAssignment) {
        let wf = Workflow::new("wf").with_task(task.clone());
        let exec = WorkflowExecution::new(&wf, None, ValueMap::new());
        let assignment = TaskAssignment {
            execution_id: exec.id,
            workflow_id: wf.id.clone(),
            attempt: 0,
            context: ValueMap::new(),
        };
        let slot = TaskSlot::new(Arc::new(RwLock::new(exec)), task.id);
        (slot, assignment)
    }

    fn retrying_task(max_attempts: u32) -> WorkflowTask {
        WorkflowTask::new("extract").with_retry(RetryPolicy::exponential(
            max_attempts,
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(1),
        ))
    }

    async fn run(
        coordinator: Arc<Flaky>,
        task: &WorkflowTask,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> (Result<TaskOutcome, TaskExecutionError>, TaskSlot) {
        let (slot, assignment) = fixture(task.clone());
        let executor = TaskExecutor::new(coordinator, EventBus::new(64));
        let outcome = executor
            .execute(TaskRequest {
                task,
                agent_id: "agent-1",
                attempt_timeout: timeout,
                assignment,
                slot: &slot,
                cancel,
            })
            .await;
        (outcome, slot)
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_exponential_backoff_then_succeeds() {
        let coordinator = Arc::new(Flaky::new(2, "connection reset"));
        let task = retrying_task(3);
        let (outcome, slot) = run(coordinator.clone(), &task, Duration::from_secs(5), &CancellationToken::new()).await;

        let outcome = outcome.unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.output["attempt"], ContextValue::from(3));

        let calls = coordinator.call_times();
        assert_eq!(calls.len(), 3);
        let first_gap = calls[1] - calls[0];
        let second_gap = calls[2] - calls[1];
        assert!(first_gap >= Duration::from_millis(100) && first_gap < Duration::from_millis(110));
        assert!(second_gap >= Duration::from_millis(200) && second_gap < Duration::from_millis(210));

        let (attempts, logs) = slot.read(|t| {
            let t = t.unwrap();
            (t.attempts, t.logs.clone())
        }).await;
        assert_eq!(attempts, 3);
        assert_eq!(logs.len(), 2);
        assert!(logs[0].starts_with("attempt 1 failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_final_attempt() {
        let coordinator = Arc::new(Flaky::new(10, "disk full"));
        let (outcome, _) = run(coordinator.clone(), &retrying_task(3), Duration::from_secs(5), &CancellationToken::new()).await;

        let err = outcome.unwrap_err();
        assert_eq!(
            err,
            TaskExecutionError::Exhausted {
                attempts: 3,
                last: "disk full".into()
            }
        );
        assert_eq!(coordinator.call_times().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_stops_immediately() {
        let coordinator = Arc::new(Flaky::new(10, "invalid input"));
        let task = WorkflowTask::new("extract").with_retry(
            RetryPolicy::exponential(5, Duration::from_millis(100), 2.0, Duration::from_secs(1))
                .with_retryable_errors(["connection reset"]),
        );
        let (outcome, _) = run(coordinator.clone(), &task, Duration::from_secs(5), &CancellationToken::new()).await;

        assert!(matches!(outcome, Err(TaskExecutionError::NonRetryable { attempt: 1, .. })));
        assert_eq!(coordinator.call_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn each_attempt_has_its_own_timeout() {
        let coordinator = Arc::new(Flaky::hanging());
        let task = retrying_task(2);
        let start = Instant::now();
        let (outcome, _) = run(coordinator.clone(), &task, Duration::from_millis(500), &CancellationToken::new()).await;

        let err = outcome.unwrap_err();
        assert_eq!(err.attempts(), 2);
        assert!(err.to_string().contains("timeout after 500ms"));
        // Two 500ms attempts plus one 100ms backoff.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1100) && elapsed < Duration::from_millis(1150));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let coordinator = Arc::new(Flaky::new(10, "boom"));
        let task = WorkflowTask::new("extract").with_retry(RetryPolicy::exponential(
            5,
            Duration::from_secs(60),
            2.0,
            Duration::from_secs(600),
        ));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let (outcome, _) = run(coordinator.clone(), &task, Duration::from_secs(5), &cancel).await;

        assert_eq!(outcome.unwrap_err(), TaskExecutionError::Cancelled { attempt: 1 });
        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(coordinator.call_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_moves_through_running_retrying_running() {
        let coordinator = Arc::new(Flaky::new(1, "connection reset"));
        let task = retrying_task(2);
        let (slot, assignment) = fixture(task.clone());
        slot.update(|t| t.status = TaskStatus::Queued).await;

        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let executor = TaskExecutor::new(coordinator, events);

        let worker_slot = slot.clone();
        let worker = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            executor
                .execute(TaskRequest {
                    task: &task,
                    agent_id: "agent-1",
                    attempt_timeout: Duration::from_secs(5),
                    assignment,
                    slot: &worker_slot,
                    cancel: &cancel,
                })
                .await
        });

        // First attempt fails at once; 50ms in, the task is waiting out its 100ms backoff.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let during_backoff = slot.read(|t| t.map(|t| (t.status, t.attempts))).await;
        assert_eq!(during_backoff, Some((TaskStatus::Retrying, 1)));

        let outcome = worker.await.unwrap().unwrap();
        assert_eq!(outcome.attempts, 2);
        let after = slot.read(|t| t.map(|t| (t.status, t.attempts))).await;
        assert_eq!(after, Some((TaskStatus::Running, 2)));

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(match event {
                ExecutionEvent::TaskStarted { attempt, .. } => format!("started:{attempt}"),
                ExecutionEvent::TaskRetrying { attempt, delay_ms, .. } => {
                    format!("retrying:{attempt}:{delay_ms}")
                }
                other => other.kind().to_string(),
            });
        }
        assert_eq!(seen, vec!["started:1", "retrying:1:100", "started:2"]);
    }
}
