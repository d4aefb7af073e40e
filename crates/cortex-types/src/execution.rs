//! Execution records: one [`WorkflowExecution`] per run, one
//! [`TaskExecution`] per task inside it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::ValueMap;
use crate::workflow::Workflow;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle state of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl WorkflowStatus {
    /// Completed, Failed, and Cancelled are final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a single task within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Resource accounting
// ---------------------------------------------------------------------------

/// Measured resource consumption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU in millicores.
    #[serde(default)]
    pub cpu: u32,
    /// Memory in megabytes.
    #[serde(default)]
    pub memory: u32,
    /// Bytes.
    #[serde(default)]
    pub network_io: u64,
    /// Bytes.
    #[serde(default)]
    pub disk_io: u64,
}

impl ResourceUsage {
    pub fn accumulate(&mut self, other: &ResourceUsage) {
        self.cpu = self.cpu.saturating_add(other.cpu);
        self.memory = self.memory.saturating_add(other.memory);
        self.network_io = self.network_io.saturating_add(other.network_io);
        self.disk_io = self.disk_io.saturating_add(other.disk_io);
    }
}

/// Aggregated numbers for an execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub skipped_tasks: u32,
    /// Mean duration of tasks that ran to a terminal state.
    pub average_task_duration_ms: u64,
    /// Largest number of tasks running at once.
    pub max_concurrent_tasks: u32,
    /// Distinct agents used.
    pub agents_utilized: u32,
    pub total_resource_usage: ResourceUsage,
}

// ---------------------------------------------------------------------------
// TaskExecution
// ---------------------------------------------------------------------------

/// Execution state of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub output: ValueMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub resource_usage: ResourceUsage,
}

impl TaskExecution {
    pub fn pending(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: None,
            status: TaskStatus::Pending,
            start_time: None,
            end_time: None,
            duration_ms: None,
            attempts: 0,
            output: ValueMap::new(),
            error: None,
            logs: Vec::new(),
            resource_usage: ResourceUsage::default(),
        }
    }

    /// Stamp `end_time` and derive `duration_ms` from `start_time`.
    pub fn mark_finished(&mut self, at: DateTime<Utc>) {
        self.end_time = Some(at);
        self.duration_ms = self
            .start_time
            .map(|start| (at - start).num_milliseconds().max(0) as u64);
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecution
// ---------------------------------------------------------------------------

/// One run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub task_executions: BTreeMap<String, TaskExecution>,
    #[serde(default)]
    pub context: ValueMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: ExecutionMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
    /// Distinct agent ids in first-use order.
    #[serde(default)]
    pub agents_used: Vec<String>,
}

impl WorkflowExecution {
    /// Create a `Pending` execution with every task `Pending`.
    ///
    /// The context is seeded from the workflow variables, then overlaid with
    /// `context`.
    pub fn new(workflow: &Workflow, triggered_by: Option<String>, context: ValueMap) -> Self {
        let task_executions = workflow
            .tasks
            .iter()
            .map(|task| (task.id.clone(), TaskExecution::pending(task.id.clone())))
            .collect();

        let mut seeded = workflow.configuration.variables.clone();
        seeded.extend(context);

        Self {
            id: Uuid::now_v7(),
            workflow_id: workflow.id.clone(),
            status: WorkflowStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            task_executions,
            context: seeded,
            error: None,
            metrics: ExecutionMetrics {
                total_tasks: workflow.tasks.len() as u32,
                ..ExecutionMetrics::default()
            },
            triggered_by,
            agents_used: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn count_tasks(&self, status: TaskStatus) -> u32 {
        self.task_executions
            .values()
            .filter(|t| t.status == status)
            .count() as u32
    }

    /// Record an agent, keeping `agents_used` duplicate-free.
    pub fn record_agent(&mut self, agent_id: &str) {
        if !self.agents_used.iter().any(|id| id == agent_id) {
            self.agents_used.push(agent_id.to_string());
        }
    }

    /// Stamp `end_time` and `duration_ms`.
    pub fn mark_finished(&mut self, at: DateTime<Utc>) {
        self.end_time = Some(at);
        self.duration_ms = Some((at - self.start_time).num_milliseconds().max(0) as u64);
    }

    /// Recompute counters, averages, and resource totals from task records.
    ///
    /// `max_concurrent_tasks` is tracked by the scheduler and left untouched.
    pub fn refresh_metrics(&mut self) {
        let mut total_usage = ResourceUsage::default();
        let mut durations: Vec<u64> = Vec::new();
        for task in self.task_executions.values() {
            total_usage.accumulate(&task.resource_usage);
            if matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
                if let Some(ms) = task.duration_ms {
                    durations.push(ms);
                }
            }
        }

        self.metrics.total_tasks = self.task_executions.len() as u32;
        self.metrics.completed_tasks = self.count_tasks(TaskStatus::Completed);
        self.metrics.failed_tasks = self.count_tasks(TaskStatus::Failed);
        self.metrics.skipped_tasks = self.count_tasks(TaskStatus::Skipped);
        self.metrics.average_task_duration_ms = if durations.is_empty() {
            0
        } else {
            durations.iter().sum::<u64>() / durations.len() as u64
        };
        self.metrics.agents_utilized = self.agents_used.len() as u32;
        self.metrics.total_resource_usage = total_usage;
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Query filters for listing executions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Match any of these statuses (empty = all).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<WorkflowStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl ExecutionFilters {
    pub fn matches(&self, execution: &WorkflowExecution) -> bool {
        if let Some(workflow_id) = &self.workflow_id {
            if &execution.workflow_id != workflow_id {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&execution.status) {
            return false;
        }
        if let Some(after) = self.start_time_after {
            if execution.start_time <= after {
                return false;
            }
        }
        if let Some(before) = self.start_time_before {
            if execution.start_time >= before {
                return false;
            }
        }
        if let Some(triggered_by) = &self.triggered_by {
            if execution.triggered_by.as_ref() != Some(triggered_by) {
                return false;
            }
        }
        true
    }

    /// Filter, sort newest first, then apply offset and limit.
    pub fn apply(&self, executions: impl IntoIterator<Item = WorkflowExecution>) -> Vec<WorkflowExecution> {
        let mut matched: Vec<WorkflowExecution> =
            executions.into_iter().filter(|e| self.matches(e)).collect();
        matched.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| b.id.cmp(&a.id)));
        matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}
