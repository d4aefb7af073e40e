//! Workflow definition types.
//!
//! A [`Workflow`] is an ordered list of [`WorkflowTask`]s plus a dependency
//! map (`task id -> ids it depends on`). Definitions are authored in YAML or
//! JSON and are immutable once an execution starts.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentSelector;
use crate::value::{ContextValue, ValueMap};

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A multi-task workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    pub tasks: Vec<WorkflowTask>,
    /// Task id -> ids of the tasks it depends on.
    #[serde(default)]
    pub dependencies: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub configuration: WorkflowConfiguration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Workflow {
    /// Create an empty workflow with the given id (name defaults to the id).
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            version: default_version(),
            tasks: Vec::new(),
            dependencies: BTreeMap::new(),
            configuration: WorkflowConfiguration::default(),
            created_by: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_task(mut self, task: WorkflowTask) -> Self {
        self.tasks.push(task);
        self
    }

    /// Declare that `task_id` depends on every id in `depends_on`.
    pub fn with_dependency<I, S>(mut self, task_id: impl Into<String>, depends_on: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .entry(task_id.into())
            .or_default()
            .extend(depends_on.into_iter().map(Into::into));
        self
    }

    pub fn with_failure_action(mut self, action: FailureAction) -> Self {
        self.configuration.failure_policy.on_task_failure = action;
        self
    }

    /// Find a task by id.
    pub fn task(&self, id: &str) -> Option<&WorkflowTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Total number of declared dependency edges.
    pub fn dependency_count(&self) -> usize {
        self.dependencies.values().map(Vec::len).sum()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Workflow-wide execution settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfiguration {
    /// Upper bound on concurrently running tasks (0 = unlimited).
    #[serde(default)]
    pub max_concurrent_tasks: u32,
    /// Per-attempt timeout for tasks that do not declare their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
    /// Deadline for the whole execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Seed values for the execution context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: ValueMap,
}

/// What to do when a task in a batch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    /// Keep scheduling later batches.
    Continue,
    /// Reserved; currently behaves exactly like `Stop`.
    RetryWorkflow,
    /// Abort after the failing batch. Unknown values also map here.
    #[default]
    #[serde(other)]
    Stop,
}

impl FailureAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureAction::Stop => "stop",
            FailureAction::Continue => "continue",
            FailureAction::RetryWorkflow => "retry_workflow",
        }
    }
}

/// Workflow failure handling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePolicy {
    #[serde(default)]
    pub on_task_failure: FailureAction,
    /// Under `continue`, stop once this many tasks have failed (0 = no limit).
    #[serde(default)]
    pub max_failed_tasks: u32,
    /// Under `continue`, a failure of any of these tasks stops the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub critical_tasks: Vec<String>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A single unit of work within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Free-form task kind interpreted by the agent (e.g. `http_request`).
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub agent_selector: AgentSelector,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: ValueMap,
    /// All conditions must hold for the task to run; otherwise it is skipped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<TaskCondition>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Per-attempt timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Higher runs first within a batch.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

impl WorkflowTask {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            task_type: String::new(),
            agent_selector: AgentSelector::default(),
            parameters: ValueMap::new(),
            conditions: Vec::new(),
            retry_policy: RetryPolicy::default(),
            timeout_ms: None,
            priority: 0,
            resources: ResourceRequirements::default(),
        }
    }

    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_condition(mut self, condition: TaskCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_selector(mut self, selector: AgentSelector) -> Self {
        self.agent_selector = selector;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Resource hints for scheduling and accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// CPU in millicores.
    #[serde(default)]
    pub cpu: u32,
    /// Memory in megabytes.
    #[serde(default)]
    pub memory: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// Supported condition predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    Always,
    Never,
    /// `parameters.key` (dotted path into the context) equals `parameters.value`.
    ContextEquals,
    /// Boolean expression over the execution context.
    Expression,
    /// Any unrecognised type; evaluates to true.
    #[serde(other)]
    Unknown,
}

/// A predicate deciding whether a task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCondition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: ValueMap,
}

impl TaskCondition {
    pub fn always() -> Self {
        Self {
            kind: ConditionKind::Always,
            expression: None,
            parameters: ValueMap::new(),
        }
    }

    pub fn never() -> Self {
        Self {
            kind: ConditionKind::Never,
            ..Self::always()
        }
    }

    pub fn context_equals(key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        let mut parameters = ValueMap::new();
        parameters.insert("key".to_string(), ContextValue::String(key.into()));
        parameters.insert("value".to_string(), value.into());
        Self {
            kind: ConditionKind::ContextEquals,
            expression: None,
            parameters,
        }
    }

    pub fn expression(expression: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Expression,
            expression: Some(expression.into()),
            parameters: ValueMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Retry configuration for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (0 is treated as 1).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Error signatures worth retrying. Empty or `"*"` retries anything.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retryable_errors: Vec<String>,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            retryable_errors: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Exponential policy with the given attempt budget and delays.
    pub fn exponential(max_attempts: u32, initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: initial.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            backoff_multiplier: multiplier,
            retryable_errors: Vec::new(),
        }
    }

    pub fn with_retryable_errors<I, S>(mut self, errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_errors = errors.into_iter().map(Into::into).collect();
        self
    }

    /// Attempt budget with `0` normalised to `1`.
    pub fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
id: nightly-etl
name: Nightly ETL
tasks:
  - id: extract
    type: http_request
    retry_policy:
      max_attempts: 3
      initial_delay_ms: 100
      retryable_errors: ["connection reset"]
  - id: transform
    priority: 5
    conditions:
      - type: context_equals
        parameters:
          key: env
          value: prod
  - id: load
    timeout_ms: 5000
dependencies:
  transform: [extract]
  load: [transform]
configuration:
  failure_policy:
    on_task_failure: continue
    critical_tasks: [load]
  variables:
    env: prod
"#;

    #[test]
    fn parses_yaml_definition() {
        let wf: Workflow = serde_yaml_ng::from_str(YAML).unwrap();
        assert_eq!(wf.id, "nightly-etl");
        assert_eq!(wf.version, "1.0.0");
        assert_eq!(wf.tasks.len(), 3);
        assert_eq!(wf.dependency_count(), 2);

        let extract = wf.task("extract").unwrap();
        assert_eq!(extract.task_type, "http_request");
        assert_eq!(extract.retry_policy.max_attempts, 3);
        assert_eq!(extract.retry_policy.max_delay_ms, 30_000);
        assert_eq!(extract.retry_policy.retryable_errors, vec!["connection reset"]);

        let transform = wf.task("transform").unwrap();
        assert_eq!(transform.priority, 5);
        assert_eq!(transform.conditions[0].kind, ConditionKind::ContextEquals);

        assert_eq!(
            wf.configuration.failure_policy.on_task_failure,
            FailureAction::Continue
        );
        assert_eq!(wf.configuration.failure_policy.critical_tasks, vec!["load"]);
    }

    #[test]
    fn unknown_failure_action_falls_back_to_stop() {
        let policy: FailurePolicy =
            serde_json::from_str(r#"{"on_task_failure":"explode"}"#).unwrap();
        assert_eq!(policy.on_task_failure, FailureAction::Stop);

        let policy: FailurePolicy =
            serde_json::from_str(r#"{"on_task_failure":"retry_workflow"}"#).unwrap();
        assert_eq!(policy.on_task_failure, FailureAction::RetryWorkflow);
        assert_eq!(serde_json::to_value(FailureAction::Stop).unwrap(), "stop");
    }

    #[test]
    fn unknown_condition_type_is_preserved_as_unknown() {
        let cond: TaskCondition = serde_json::from_str(r#"{"type":"moon_phase"}"#).unwrap();
        assert_eq!(cond.kind, ConditionKind::Unknown);
    }

    #[test]
    fn retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.initial_delay(), Duration::from_secs(1));
        assert_eq!(policy.backoff_multiplier, 2.0);

        let zero = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(zero.effective_max_attempts(), 1);
    }

    #[test]
    fn builder_helpers_compose() {
        let wf = Workflow::new("wf")
            .with_task(WorkflowTask::new("a"))
            .with_task(WorkflowTask::new("b").with_priority(2))
            .with_dependency("b", ["a"])
            .with_failure_action(FailureAction::Continue);

        assert_eq!(wf.dependencies["b"], vec!["a"]);
        assert_eq!(wf.task("b").unwrap().priority, 2);
        assert_eq!(
            wf.configuration.failure_policy.on_task_failure,
            FailureAction::Continue
        );
    }

    #[test]
    fn context_equals_condition_builder() {
        let cond = TaskCondition::context_equals("env", "prod");
        assert_eq!(cond.parameters["key"], ContextValue::from("env"));
        assert_eq!(cond.parameters["value"], ContextValue::from("prod"));
    }
}
