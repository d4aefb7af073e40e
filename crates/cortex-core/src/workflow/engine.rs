//! `WorkflowEngine`: the public facade over validation, scheduling, and
//! execution lifecycle.
//!
//! `execute_workflow` validates, creates a `Pending` record, persists it,
//! registers the live run, notifies the monitor, and returns immediately.
//! The run itself is spawned onto the engine's task tracker and delegated to
//! the `BatchScheduler`; when it ends, the engine aggregates metrics, sets
//! the terminal status, persists, unregisters, and stops monitoring.
//!
//! Repository and monitor failures are logged and never stop a run. The live
//! record in the registry is authoritative while a run is in flight.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use cortex_types::config::OrchestrationConfig;
use cortex_types::error::RepositoryError;
use cortex_types::event::ExecutionEvent;
use cortex_types::execution::{ExecutionFilters, TaskStatus, WorkflowExecution, WorkflowStatus};
use cortex_types::value::ValueMap;
use cortex_types::workflow::Workflow;
use thiserror::Error;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::control::RunControl;
use super::definition::{WorkflowError, validate_workflow};
use super::graph::GraphError;
use super::registry::{ActiveRun, ExecutionRegistry};
use super::scheduler::{BatchScheduler, RunContext, RunOutcome, SchedulerError};
use crate::agent::AgentCoordinator;
use crate::event::EventBus;
use crate::monitor::ExecutionMonitor;
use crate::repository::WorkflowRepository;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("cannot {action} execution {id} in status {from}")]
    InvalidTransition {
        id: Uuid,
        from: WorkflowStatus,
        action: &'static str,
    },

    #[error("concurrent workflow limit reached")]
    ConcurrencyLimitReached,

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// ExecutionRequest
// ---------------------------------------------------------------------------

/// Optional inputs for starting an execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionRequest {
    /// Free-form trigger label (e.g. `"cli"`, `"retry:<id>"`).
    pub triggered_by: Option<String>,
    /// Overlaid on the workflow's `variables` to seed the context.
    pub context: ValueMap,
}

impl ExecutionRequest {
    pub fn triggered_by(trigger: impl Into<String>) -> Self {
        Self {
            triggered_by: Some(trigger.into()),
            context: ValueMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Orchestration facade. Cheap to clone; clones share every run.
pub struct WorkflowEngine<C, R, M> {
    inner: Arc<EngineInner<C, R, M>>,
}

struct EngineInner<C, R, M> {
    config: OrchestrationConfig,
    repository: Arc<R>,
    monitor: Arc<M>,
    registry: ExecutionRegistry,
    events: EventBus,
    scheduler: BatchScheduler<C>,
    limiter: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl<C, R, M> Clone for WorkflowEngine<C, R, M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C, R, M> WorkflowEngine<C, R, M>
where
    C: AgentCoordinator,
    R: WorkflowRepository,
    M: ExecutionMonitor,
{
    pub fn new(config: OrchestrationConfig, coordinator: Arc<C>, repository: Arc<R>, monitor: Arc<M>) -> Self {
        Self::with_registry(config, coordinator, repository, monitor, ExecutionRegistry::new())
    }

    /// Build an engine around an existing live-execution registry.
    pub fn with_registry(
        config: OrchestrationConfig,
        coordinator: Arc<C>,
        repository: Arc<R>,
        monitor: Arc<M>,
        registry: ExecutionRegistry,
    ) -> Self {
        let events = EventBus::new(config.event_bus_capacity);
        let scheduler = BatchScheduler::new(coordinator, events.clone(), &config);
        let limiter = (config.max_concurrent_workflows > 0)
            .then(|| Arc::new(Semaphore::new(config.max_concurrent_workflows as usize)));

        Self {
            inner: Arc::new(EngineInner {
                config,
                repository,
                monitor,
                registry,
                events,
                scheduler,
                limiter,
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &OrchestrationConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.inner.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Execute
    // -----------------------------------------------------------------------

    pub async fn execute_workflow(&self, workflow: Workflow) -> Result<WorkflowExecution, EngineError> {
        self.execute_workflow_with(workflow, ExecutionRequest::default())
            .await
    }

    /// Validate `workflow`, register a new execution, and start it in the
    /// background. Returns the `Pending` record.
    ///
    /// Validation failures create no record.
    pub async fn execute_workflow_with(
        &self,
        workflow: Workflow,
        request: ExecutionRequest,
    ) -> Result<WorkflowExecution, EngineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        validate_workflow(&workflow)?;

        let permit = match &self.inner.limiter {
            Some(limiter) => Some(
                limiter
                    .clone()
                    .try_acquire_owned()
                    .map_err(|_| EngineError::ConcurrencyLimitReached)?,
            ),
            None => None,
        };

        let execution = WorkflowExecution::new(&workflow, request.triggered_by, request.context);
        let execution_id = execution.id;

        if let Err(e) = self.inner.repository.store_workflow(&workflow).await {
            tracing::warn!(workflow_id = workflow.id.as_str(), error = %e, "failed to store workflow");
        }
        if let Err(e) = self.inner.repository.store_execution(&execution).await {
            tracing::warn!(execution_id = %execution_id, error = %e, "failed to store execution");
        }

        let control = RunControl::with_token(self.inner.shutdown.child_token());
        let active = ActiveRun::new(execution.clone(), control.clone());
        self.inner.registry.insert(execution_id, active.clone());

        if let Err(e) = self.inner.monitor.start_monitoring(&execution).await {
            tracing::warn!(execution_id = %execution_id, error = %e, "failed to start monitoring");
        }

        self.inner.events.publish(ExecutionEvent::ExecutionStarted {
            execution_id,
            workflow_id: workflow.id.clone(),
            total_tasks: execution.metrics.total_tasks,
            at: execution.start_time,
        });
        tracing::info!(
            execution_id = %execution_id,
            workflow_id = workflow.id.as_str(),
            tasks = workflow.tasks.len(),
            triggered_by = execution.triggered_by.as_deref().unwrap_or("-"),
            "execution started"
        );

        let run = RunContext {
            execution_id,
            workflow: Arc::new(workflow),
            state: active.state,
            control,
        };
        let engine = self.clone();
        self.inner.tracker.spawn(async move {
            let _permit = permit;
            engine.drive(run).await;
        });

        Ok(execution)
    }

    /// Body of the spawned run task.
    async fn drive(&self, run: RunContext) {
        {
            let mut execution = run.state.write().await;
            if execution.status == WorkflowStatus::Pending {
                execution.status = WorkflowStatus::Running;
                self.persist(&execution).await;
            }
        }

        let result = self.inner.scheduler.run(&run).await;
        self.finalize(&run, result).await;
    }

    /// Aggregate, set the terminal status, persist, unregister, stop monitoring.
    async fn finalize(&self, run: &RunContext, result: Result<RunOutcome, SchedulerError>) {
        let now = Utc::now();
        let (execution, cancel_requested) = {
            let mut execution = run.state.write().await;
            let cancel_requested = execution.status == WorkflowStatus::Cancelled;

            if !cancel_requested {
                match &result {
                    Ok(RunOutcome::Completed { .. }) => execution.status = WorkflowStatus::Completed,
                    Ok(RunOutcome::Cancelled) => execution.status = WorkflowStatus::Cancelled,
                    Err(e) => {
                        execution.status = WorkflowStatus::Failed;
                        execution.error = Some(e.to_string());
                    }
                }
            }

            for task in execution.task_executions.values_mut() {
                if matches!(
                    task.status,
                    TaskStatus::Queued | TaskStatus::Running | TaskStatus::Retrying
                ) {
                    task.status = TaskStatus::Failed;
                    task.error.get_or_insert_with(|| "interrupted before completion".to_string());
                    task.mark_finished(now);
                }
            }

            execution.mark_finished(now);
            execution.refresh_metrics();
            self.persist(&execution).await;
            (execution.clone(), cancel_requested)
        };

        self.inner.registry.remove(execution.id);
        if let Err(e) = self.inner.monitor.stop_monitoring(execution.id).await {
            tracing::warn!(execution_id = %execution.id, error = %e, "failed to stop monitoring");
        }

        let duration_ms = execution.duration_ms.unwrap_or(0);
        match execution.status {
            WorkflowStatus::Completed => {
                self.inner.events.publish(ExecutionEvent::ExecutionCompleted {
                    execution_id: execution.id,
                    duration_ms,
                    failed_tasks: execution.metrics.failed_tasks,
                });
                tracing::info!(
                    execution_id = %execution.id,
                    duration_ms,
                    completed = execution.metrics.completed_tasks,
                    failed = execution.metrics.failed_tasks,
                    skipped = execution.metrics.skipped_tasks,
                    "execution completed"
                );
            }
            WorkflowStatus::Cancelled => {
                if !cancel_requested {
                    self.inner.events.publish(ExecutionEvent::ExecutionCancelled {
                        execution_id: execution.id,
                    });
                }
                tracing::info!(execution_id = %execution.id, duration_ms, "execution cancelled");
            }
            _ => {
                let error = execution.error.clone().unwrap_or_default();
                self.inner.events.publish(ExecutionEvent::ExecutionFailed {
                    execution_id: execution.id,
                    error: error.clone(),
                });
                tracing::error!(
                    execution_id = %execution.id,
                    duration_ms,
                    error = error.as_str(),
                    "execution failed"
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Live snapshot if the run is in flight, else the stored record.
    pub async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        if let Some(snapshot) = self.inner.registry.snapshot(id).await {
            return Ok(snapshot);
        }
        self.inner
            .repository
            .get_execution(id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(id))
    }

    /// Stored and live executions matching `filters`, newest first.
    ///
    /// Live snapshots replace stored copies of the same execution.
    pub async fn list_executions(&self, filters: &ExecutionFilters) -> Result<Vec<WorkflowExecution>, EngineError> {
        let unpaged = ExecutionFilters {
            limit: None,
            offset: 0,
            ..filters.clone()
        };

        let mut merged: BTreeMap<Uuid, WorkflowExecution> = BTreeMap::new();
        match self.inner.repository.list_executions(&unpaged).await {
            Ok(stored) => merged.extend(stored.into_iter().map(|e| (e.id, e))),
            Err(e) => tracing::warn!(error = %e, "failed to list stored executions, using live runs only"),
        }
        for snapshot in self.inner.registry.snapshots().await {
            merged.insert(snapshot.id, snapshot);
        }

        Ok(filters.apply(merged.into_values()))
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Mark the run `Cancelled` and signal it. The batch in flight finishes;
    /// pending retry backoffs abort immediately; no further batch starts.
    pub async fn cancel_execution(&self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        let active = self.live(id, "cancel").await?;
        let snapshot = {
            let mut execution = active.state.write().await;
            if execution.is_terminal() {
                return Err(EngineError::InvalidTransition {
                    id,
                    from: execution.status,
                    action: "cancel",
                });
            }
            execution.status = WorkflowStatus::Cancelled;
            self.persist(&execution).await;
            execution.clone()
        };
        active.control.cancel();

        self.inner.events.publish(ExecutionEvent::ExecutionCancelled { execution_id: id });
        tracing::info!(execution_id = %id, "execution cancel requested");
        Ok(snapshot)
    }

    /// Hold the run before its next batch.
    pub async fn pause_execution(&self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        let active = self.live(id, "pause").await?;
        let snapshot = {
            let mut execution = active.state.write().await;
            if !matches!(execution.status, WorkflowStatus::Pending | WorkflowStatus::Running) {
                return Err(EngineError::InvalidTransition {
                    id,
                    from: execution.status,
                    action: "pause",
                });
            }
            execution.status = WorkflowStatus::Paused;
            self.persist(&execution).await;
            execution.clone()
        };
        active.control.pause();

        self.inner.events.publish(ExecutionEvent::ExecutionPaused { execution_id: id });
        tracing::info!(execution_id = %id, "execution paused");
        Ok(snapshot)
    }

    /// Reopen the pause gate of a `Paused` run.
    pub async fn resume_execution(&self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        let active = self.live(id, "resume").await?;
        let snapshot = {
            let mut execution = active.state.write().await;
            if execution.status != WorkflowStatus::Paused {
                return Err(EngineError::InvalidTransition {
                    id,
                    from: execution.status,
                    action: "resume",
                });
            }
            execution.status = WorkflowStatus::Running;
            self.persist(&execution).await;
            execution.clone()
        };
        active.control.resume();

        self.inner.events.publish(ExecutionEvent::ExecutionResumed { execution_id: id });
        tracing::info!(execution_id = %id, "execution resumed");
        Ok(snapshot)
    }

    /// Start a fresh execution of the workflow behind a finished execution.
    ///
    /// The new run gets a new id, a context seeded only from the workflow
    /// variables, and `triggered_by = "retry:<id>"`.
    pub async fn retry_execution(&self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        let previous = self.get_execution(id).await?;
        if !previous.is_terminal() {
            return Err(EngineError::InvalidTransition {
                id,
                from: previous.status,
                action: "retry",
            });
        }

        let workflow = self
            .inner
            .repository
            .get_workflow(&previous.workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(previous.workflow_id.clone()))?;

        tracing::info!(
            execution_id = %id,
            workflow_id = previous.workflow_id.as_str(),
            "retrying execution"
        );
        self.execute_workflow_with(workflow, ExecutionRequest::triggered_by(format!("retry:{id}")))
            .await
    }

    /// Cancel every live run and wait for all of them to finalize.
    pub async fn shutdown(&self) {
        let live = self.inner.registry.len();
        tracing::info!(live, "workflow engine shutting down");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::info!("workflow engine stopped");
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Live handle for `id`. For runs that already ended, reports the stored
    /// status as an invalid transition.
    async fn live(&self, id: Uuid, action: &'static str) -> Result<ActiveRun, EngineError> {
        if let Some(active) = self.inner.registry.get(id) {
            return Ok(active);
        }
        match self.inner.repository.get_execution(id).await? {
            Some(stored) => Err(EngineError::InvalidTransition {
                id,
                from: stored.status,
                action,
            }),
            None => Err(EngineError::ExecutionNotFound(id)),
        }
    }

    /// Write `execution` to the repository.
    ///
    /// Callers hold the run's state lock across this call, so stored records
    /// are written in the same order the state changed.
    async fn persist(&self, execution: &WorkflowExecution) {
        if let Err(e) = self.inner.repository.update_execution(execution).await {
            tracing::warn!(
                execution_id = %execution.id,
                status = execution.status.as_str(),
                error = %e,
                "failed to persist execution"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
