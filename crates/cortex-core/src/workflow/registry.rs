//! Registry of in-flight executions.
//!
//! A sharded map keyed by execution id. Each entry owns the authoritative
//! in-memory record behind an async `RwLock` plus the run's control handle.
//! Readers take snapshots; writers hold the lock only for short closures and
//! never across collaborator calls.

use std::sync::Arc;

use cortex_types::execution::WorkflowExecution;
use dashmap::DashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::control::RunControl;

/// Authoritative in-memory execution record shared by the engine and scheduler.
pub type SharedExecution = Arc<RwLock<WorkflowExecution>>;

/// One live execution.
#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub state: SharedExecution,
    pub control: RunControl,
}

impl ActiveRun {
    pub fn new(execution: WorkflowExecution, control: RunControl) -> Self {
        Self {
            state: Arc::new(RwLock::new(execution)),
            control,
        }
    }

    pub async fn snapshot(&self) -> WorkflowExecution {
        self.state.read().await.clone()
    }
}

/// Concurrency-safe store of live executions, injected into the engine.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRegistry {
    runs: Arc<DashMap<Uuid, ActiveRun>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: Uuid, run: ActiveRun) {
        self.runs.insert(id, run);
    }

    /// Clone the handle out so no shard lock outlives this call.
    pub fn get(&self, id: Uuid) -> Option<ActiveRun> {
        self.runs.get(&id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: Uuid) -> Option<ActiveRun> {
        self.runs.remove(&id).map(|(_, run)| run)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.runs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Handles for every live run.
    pub fn runs(&self) -> Vec<(Uuid, ActiveRun)> {
        self.runs
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub async fn snapshot(&self, id: Uuid) -> Option<WorkflowExecution> {
        let run = self.get(id)?;
        Some(run.snapshot().await)
    }

    pub async fn snapshots(&self) -> Vec<WorkflowExecution> {
        let mut out = Vec::with_capacity(self.runs.len());
        for (_, run) in self.runs() {
            out.push(run.snapshot().await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_types::execution::WorkflowStatus;
    use cortex_types::value::ValueMap;
    use cortex_types::workflow::{Workflow, WorkflowTask};

    fn execution() -> WorkflowExecution {
        let wf = Workflow::new("wf").with_task(WorkflowTask::new("a"));
        WorkflowExecution::new(&wf, None, ValueMap::new())
    }

    #[tokio::test]
    async fn snapshots_reflect_writes() {
        let registry = ExecutionRegistry::new();
        let exec = execution();
        let id = exec.id;
        registry.insert(id, ActiveRun::new(exec, RunControl::new()));

        let run = registry.get(id).unwrap();
        run.state.write().await.status = WorkflowStatus::Running;

        assert_eq!(registry.snapshot(id).await.unwrap().status, WorkflowStatus::Running);
        assert_eq!(registry.snapshots().await.len(), 1);
    }

    #[tokio::test]
    async fn remove_and_missing_lookups() {
        let registry = ExecutionRegistry::new();
        let exec = execution();
        let id = exec.id;
        registry.insert(id, ActiveRun::new(exec, RunControl::new()));
        assert!(registry.contains(id));

        assert!(registry.remove(id).is_some());
        assert!(registry.is_empty());
        assert!(registry.snapshot(id).await.is_none());
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn clones_share_storage() {
        let registry = ExecutionRegistry::new();
        let other = registry.clone();
        let exec = execution();
        other.insert(exec.id, ActiveRun::new(exec, RunControl::new()));
        assert_eq!(registry.len(), 1);
    }
}
