//! Workflow subcommands: validate, plan, and run.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use tokio::sync::broadcast;

use cortex_core::event::dispatcher::{EventDispatcher, EventHandler, EventHandlerDyn, EventHandlerError};
use cortex_core::workflow::definition::load_workflow_file;
use cortex_core::workflow::{DependencyGraph, ExecutionRequest, WorkflowEngine};
use cortex_infra::config::load_orchestration_config;
use cortex_infra::{InMemoryMonitor, InMemoryWorkflowRepository, LocalAgentCoordinator};
use cortex_types::config::OrchestrationConfig;
use cortex_types::event::ExecutionEvent;
use cortex_types::execution::{TaskStatus, WorkflowExecution, WorkflowStatus};
use cortex_types::workflow::Workflow;

type LocalEngine = WorkflowEngine<LocalAgentCoordinator, InMemoryWorkflowRepository, InMemoryMonitor>;

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

/// Parse, validate, and check the dependency graph for cycles.
pub fn validate(file: &Path, json: bool) -> Result<()> {
    let (workflow, graph) = load_and_check(file)?;

    if json {
        let output = serde_json::json!({
            "valid": true,
            "workflow_id": workflow.id,
            "tasks": workflow.tasks.len(),
            "dependencies": workflow.dependency_count(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!(
        "{} Workflow '{}' is valid ({} tasks, {} dependencies)",
        style("✓").green().bold(),
        style(&workflow.id).cyan(),
        graph.node_count(),
        graph.edge_count(),
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// plan
// ---------------------------------------------------------------------------

/// Print the execution batches and graph shape.
pub fn plan(file: &Path, json: bool) -> Result<()> {
    let (workflow, graph) = load_and_check(file)?;
    let batches = graph.get_execution_batches()?;
    let info = graph.graph_info();

    if json {
        let output = serde_json::json!({
            "workflow_id": workflow.id,
            "batches": batches,
            "graph": info,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Batch").fg(Color::Cyan),
            Cell::new("Tasks").fg(Color::Cyan),
            Cell::new("Width").fg(Color::Cyan),
        ]);

    for (index, batch) in batches.iter().enumerate() {
        table.add_row(vec![
            Cell::new(index),
            Cell::new(batch.join(", ")),
            Cell::new(batch.len()),
        ]);
    }

    println!("{}", style(format!("Plan for '{}'", workflow.id)).bold());
    println!("{table}");
    println!(
        "  {} nodes, {} edges, depth {}, max parallelism {}",
        info.total_nodes, info.total_edges, info.max_depth, info.max_parallelism
    );
    Ok(())
}

fn load_and_check(file: &Path) -> Result<(Workflow, DependencyGraph)> {
    let workflow = load_workflow_file(file)
        .with_context(|| format!("failed to load workflow from {}", file.display()))?;
    let graph = DependencyGraph::from_workflow(&workflow)?;
    graph
        .validate_acyclic()
        .with_context(|| format!("workflow '{}' has a dependency cycle", workflow.id))?;
    Ok((workflow, graph))
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

/// Run a workflow on `agents` local echo agents and print the outcome.
///
/// Ctrl-C cancels the execution; the batch in flight still finishes.
pub async fn run(file: &Path, agents: usize, config: Option<&Path>, json: bool, quiet: bool) -> Result<()> {
    if agents == 0 {
        bail!("--agents must be at least 1");
    }
    let (workflow, _) = load_and_check(file)?;
    let config = match config {
        Some(path) => load_orchestration_config(path).await,
        None => OrchestrationConfig::default(),
    };

    let execution = execute_locally(workflow, agents, config, !json && !quiet).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else if !quiet {
        print_summary(&execution);
    }

    match execution.status {
        WorkflowStatus::Completed => Ok(()),
        WorkflowStatus::Cancelled => bail!("execution {} was cancelled", execution.id),
        status => bail!(
            "execution {} ended {}: {}",
            execution.id,
            status,
            execution.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

async fn execute_locally(
    workflow: Workflow,
    agents: usize,
    config: OrchestrationConfig,
    progress: bool,
) -> Result<WorkflowExecution> {
    let coordinator = Arc::new(
        LocalAgentCoordinator::with_echo_agents(agents).with_default_strategy(config.task_distribution_strategy),
    );
    let engine: LocalEngine = WorkflowEngine::new(
        config.clone(),
        coordinator,
        Arc::new(InMemoryWorkflowRepository::new()),
        Arc::new(InMemoryMonitor::new()),
    );

    let handlers: Vec<Arc<dyn EventHandlerDyn>> = vec![Arc::new(LogEventHandler)];
    let dispatcher = EventDispatcher::spawn(
        engine.events(),
        handlers,
        config.event_workers,
        config.event_queue_capacity,
    );

    let mut events = engine.subscribe();
    let started = engine
        .execute_workflow_with(workflow, ExecutionRequest::triggered_by("cli"))
        .await?;
    let id = started.id;
    if progress {
        println!(
            "{} Started execution {} of '{}' on {} agent(s)",
            style("▸").cyan().bold(),
            style(id).dim(),
            style(&started.workflow_id).cyan(),
            agents,
        );
    }

    let mut watch_ctrl_c = true;
    loop {
        let received = tokio::select! {
            received = events.recv() => received,
            signal = tokio::signal::ctrl_c(), if watch_ctrl_c => {
                if let Err(e) = signal {
                    tracing::warn!(error = %e, "failed to listen for ctrl-c");
                    watch_ctrl_c = false;
                    continue;
                }
                if progress {
                    println!("{} Cancelling after the current batch...", style("!").yellow().bold());
                }
                if let Err(e) = engine.cancel_execution(id).await {
                    tracing::warn!(execution_id = %id, error = %e, "cancel failed");
                }
                // User cancellation publishes no terminal event; shutdown waits for the run.
                break;
            }
        };

        match received {
            Ok(event) if event.execution_id() == id => {
                if progress {
                    print_progress(&event);
                }
                if matches!(
                    event,
                    ExecutionEvent::ExecutionCompleted { .. }
                        | ExecutionEvent::ExecutionFailed { .. }
                        | ExecutionEvent::ExecutionCancelled { .. }
                ) {
                    break;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "progress display lagged behind events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    engine.shutdown().await;
    dispatcher.shutdown().await;
    Ok(engine.get_execution(id).await?)
}

fn print_progress(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::BatchStarted {
            batch_index, task_ids, ..
        } => println!("  {} batch {batch_index}: {}", style("●").cyan(), task_ids.join(", ")),
        ExecutionEvent::TaskCompleted {
            task_id,
            attempts,
            duration_ms,
            ..
        } => println!(
            "    {} {task_id} ({duration_ms}ms, {attempts} attempt(s))",
            style("✓").green()
        ),
        ExecutionEvent::TaskRetrying {
            task_id,
            attempt,
            delay_ms,
            error,
            ..
        } => println!(
            "    {} {task_id} attempt {attempt} failed: {error}; retrying in {delay_ms}ms",
            style("↻").yellow()
        ),
        ExecutionEvent::TaskFailed { task_id, error, .. } => {
            println!("    {} {task_id}: {error}", style("✗").red())
        }
        ExecutionEvent::TaskSkipped { task_id, .. } => {
            println!("    {} {task_id} skipped", style("-").dim())
        }
        _ => {}
    }
}

fn print_summary(execution: &WorkflowExecution) {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Task").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Agent").fg(Color::Cyan),
            Cell::new("Attempts").fg(Color::Cyan),
            Cell::new("Duration").fg(Color::Cyan),
            Cell::new("Error").fg(Color::Cyan),
        ]);

    for task in execution.task_executions.values() {
        let status_color = match task.status {
            TaskStatus::Completed => Color::Green,
            TaskStatus::Failed => Color::Red,
            TaskStatus::Skipped => Color::DarkGrey,
            _ => Color::Yellow,
        };
        table.add_row(vec![
            Cell::new(&task.task_id),
            Cell::new(task.status).fg(status_color),
            Cell::new(task.agent_id.as_deref().unwrap_or("-")),
            Cell::new(task.attempts),
            Cell::new(task.duration_ms.map_or_else(|| "-".to_string(), |ms| format!("{ms}ms"))),
            Cell::new(task.error.as_deref().unwrap_or("")),
        ]);
    }

    println!();
    println!("{table}");

    let status = match execution.status {
        WorkflowStatus::Completed => style(execution.status.as_str()).green().bold(),
        WorkflowStatus::Failed => style(execution.status.as_str()).red().bold(),
        _ => style(execution.status.as_str()).yellow().bold(),
    };
    let metrics = &execution.metrics;
    println!(
        "  Execution {} {} in {}ms: {} completed, {} failed, {} skipped, {} agent(s), peak concurrency {}",
        style(execution.id).dim(),
        status,
        execution.duration_ms.unwrap_or(0),
        metrics.completed_tasks,
        metrics.failed_tasks,
        metrics.skipped_tasks,
        metrics.agents_utilized,
        metrics.max_concurrent_tasks,
    );
    if let Some(error) = &execution.error {
        println!("  {} {error}", style("Error:").red().bold());
    }
}

// ---------------------------------------------------------------------------
// Event logging
// ---------------------------------------------------------------------------

/// Writes every execution event to the tracing log.
struct LogEventHandler;

impl EventHandler for LogEventHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, event: &ExecutionEvent) -> Result<(), EventHandlerError> {
        tracing::debug!(
            execution_id = %event.execution_id(),
            kind = event.kind(),
            "execution event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DIAMOND: &str = r#"
id: diamond
tasks:
  - id: a
  - id: b
  - id: c
  - id: d
dependencies:
  b: [a]
  c: [a]
  d: [b, c]
"#;

    fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn load_and_check_accepts_a_dag() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "diamond.yaml", DIAMOND);

        let (workflow, graph) = load_and_check(&path).unwrap();
        assert_eq!(workflow.id, "diamond");
        assert_eq!(
            graph.get_execution_batches().unwrap(),
            vec![vec!["a"], vec!["b", "c"], vec!["d"]]
        );
    }

    #[test]
    fn load_and_check_rejects_a_cycle() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "cycle.yaml",
            "id: loop\ntasks:\n  - id: a\n  - id: b\ndependencies:\n  a: [b]\n  b: [a]\n",
        );

        let err = load_and_check(&path).unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err:#}");
    }

    #[test]
    fn validate_reports_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = validate(&dir.path().join("nope.yaml"), true).unwrap_err();
        assert!(err.to_string().contains("failed to load workflow"));
    }

    #[test]
    fn plan_prints_json() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "diamond.json", r#"{"id": "wf", "tasks": [{"id": "a"}, {"id": "b"}], "dependencies": {"b": ["a"]}}"#);
        plan(&path, true).unwrap();
    }

    #[tokio::test]
    async fn execute_locally_completes_the_diamond() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "diamond.yaml", DIAMOND);
        let (workflow, _) = load_and_check(&path).unwrap();

        let execution = execute_locally(workflow, 2, OrchestrationConfig::default(), false)
            .await
            .unwrap();

        assert_eq!(execution.status, WorkflowStatus::Completed);
        assert_eq!(execution.metrics.completed_tasks, 4);
        assert_eq!(execution.triggered_by.as_deref(), Some("cli"));
        assert!(execution.metrics.agents_utilized >= 1);
    }

    #[tokio::test]
    async fn run_rejects_zero_agents() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "diamond.yaml", DIAMOND);
        assert!(run(&path, 0, None, true, true).await.is_err());
    }
}
