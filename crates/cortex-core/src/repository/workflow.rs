//! Workflow and execution repository trait definition.

use cortex_types::error::RepositoryError;
use cortex_types::execution::{ExecutionFilters, WorkflowExecution};
use cortex_types::workflow::Workflow;
use uuid::Uuid;

/// Persistence for workflow definitions and execution records.
///
/// The engine treats every write as best effort: failures are logged and the
/// in-memory run stays authoritative. Writes are last-write-wins.
pub trait WorkflowRepository: Send + Sync + 'static {
    /// Store (or replace) a workflow definition.
    fn store_workflow(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow definition by id.
    fn get_workflow(
        &self,
        workflow_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// Insert a new execution record.
    fn store_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an execution record by id.
    fn get_execution(
        &self,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    /// Overwrite an existing execution record.
    fn update_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List execution records matching `filters` (newest first, paginated).
    fn list_executions(
        &self,
        filters: &ExecutionFilters,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;
}
