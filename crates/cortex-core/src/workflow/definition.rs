//! Workflow definition parsing and validation.
//!
//! Converts YAML or JSON documents into [`Workflow`] values and checks the
//! structural constraints an execution relies on (unique task ids, resolvable
//! dependencies, sane retry policies).

use std::collections::HashSet;
use std::path::Path;

use cortex_types::workflow::Workflow;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating a workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `Workflow`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<Workflow, WorkflowError> {
    let workflow: Workflow =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_workflow(&workflow)?;
    Ok(workflow)
}

/// Parse a JSON string into a validated `Workflow`.
pub fn parse_workflow_json(json: &str) -> Result<Workflow, WorkflowError> {
    let workflow: Workflow =
        serde_json::from_str(json).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_workflow(&workflow)?;
    Ok(workflow)
}

/// Load a workflow file. `.json` files are read as JSON, anything else as YAML.
pub fn load_workflow_file(path: &Path) -> Result<Workflow, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        parse_workflow_json(&content)
    } else {
        parse_workflow_yaml(&content)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `Workflow`.
///
/// Checks:
/// - Workflow id is non-empty
/// - At least one task exists
/// - Task ids are non-empty and unique
/// - Every dependency key and every listed dependency is a declared task id
/// - Retry policies have `backoff_multiplier >= 1` and `initial_delay <= max_delay`
///
/// Cycles are not checked here; they surface from the dependency graph.
pub fn validate_workflow(workflow: &Workflow) -> Result<(), WorkflowError> {
    if workflow.id.trim().is_empty() {
        return Err(WorkflowError::Validation(
            "workflow id must not be empty".to_string(),
        ));
    }

    if workflow.tasks.is_empty() {
        return Err(WorkflowError::Validation(
            "workflow must have at least one task".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for task in &workflow.tasks {
        if task.id.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "task id must not be empty".to_string(),
            ));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(WorkflowError::Validation(format!(
                "duplicate task id: '{}'",
                task.id
            )));
        }

        let policy = &task.retry_policy;
        if policy.backoff_multiplier.is_nan() || policy.backoff_multiplier < 1.0 {
            return Err(WorkflowError::Validation(format!(
                "task '{}' has backoff_multiplier {} (must be >= 1.0)",
                task.id, policy.backoff_multiplier
            )));
        }
        if policy.initial_delay_ms > policy.max_delay_ms {
            return Err(WorkflowError::Validation(format!(
                "task '{}' has initial_delay_ms {} greater than max_delay_ms {}",
                task.id, policy.initial_delay_ms, policy.max_delay_ms
            )));
        }
    }

    for (task_id, depends_on) in &workflow.dependencies {
        if !seen.contains(task_id.as_str()) {
            return Err(WorkflowError::Validation(format!(
                "dependencies reference unknown task '{task_id}'"
            )));
        }
        for dep in depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(WorkflowError::Validation(format!(
                    "task '{task_id}' depends on unknown task '{dep}'"
                )));
            }
        }
    }

    for critical in &workflow.configuration.failure_policy.critical_tasks {
        if !seen.contains(critical.as_str()) {
            return Err(WorkflowError::Validation(format!(
                "critical task '{critical}' is not declared"
            )));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
