//! In-memory implementation of `WorkflowRepository`.

use cortex_core::repository::WorkflowRepository;
use cortex_types::error::RepositoryError;
use cortex_types::execution::{ExecutionFilters, WorkflowExecution};
use cortex_types::workflow::Workflow;
use dashmap::DashMap;
use uuid::Uuid;

/// Workflow definitions and execution records held in sharded maps.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    workflows: DashMap<String, Workflow>,
    executions: DashMap<Uuid, WorkflowExecution>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflow_count(&self) -> usize {
        self.workflows.len()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn store_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        self.workflows.insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>, RepositoryError> {
        Ok(self.workflows.get(workflow_id).map(|w| w.value().clone()))
    }

    async fn store_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        if self.executions.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        self.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(self.executions.get(&id).map(|e| e.value().clone()))
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        match self.executions.get_mut(&execution.id) {
            Some(mut stored) => {
                *stored = execution.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_executions(&self, filters: &ExecutionFilters) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let all: Vec<WorkflowExecution> = self.executions.iter().map(|e| e.value().clone()).collect();
        Ok(filters.apply(all))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_types::execution::WorkflowStatus;
    use cortex_types::value::ValueMap;
    use cortex_types::workflow::WorkflowTask;

    fn workflow(id: &str) -> Workflow {
        Workflow::new(id).with_task(WorkflowTask::new("a"))
    }

    #[tokio::test]
    async fn store_and_get_workflow() {
        let repo = InMemoryWorkflowRepository::new();
        repo.store_workflow(&workflow("etl")).await.unwrap();
        repo.store_workflow(&workflow("etl")).await.unwrap();

        assert_eq!(repo.workflow_count(), 1);
        assert_eq!(repo.get_workflow("etl").await.unwrap().unwrap().id, "etl");
        assert!(repo.get_workflow("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_rejects_duplicate_execution() {
        let repo = InMemoryWorkflowRepository::new();
        let exec = WorkflowExecution::new(&workflow("etl"), None, ValueMap::new());

        repo.store_execution(&exec).await.unwrap();
        let err = repo.store_execution(&exec).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_overwrites_and_requires_existing() {
        let repo = InMemoryWorkflowRepository::new();
        let mut exec = WorkflowExecution::new(&workflow("etl"), None, ValueMap::new());

        assert!(matches!(
            repo.update_execution(&exec).await,
            Err(RepositoryError::NotFound)
        ));

        repo.store_execution(&exec).await.unwrap();
        exec.status = WorkflowStatus::Running;
        repo.update_execution(&exec).await.unwrap();

        let stored = repo.get_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn list_applies_filters() {
        let repo = InMemoryWorkflowRepository::new();
        for id in ["etl", "etl", "report"] {
            let exec = WorkflowExecution::new(&workflow(id), None, ValueMap::new());
            repo.store_execution(&exec).await.unwrap();
        }

        let etl = repo
            .list_executions(&ExecutionFilters {
                workflow_id: Some("etl".into()),
                ..ExecutionFilters::default()
            })
            .await
            .unwrap();
        assert_eq!(etl.len(), 2);

        let limited = repo
            .list_executions(&ExecutionFilters {
                limit: Some(1),
                ..ExecutionFilters::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(repo.execution_count(), 3);
    }
}
