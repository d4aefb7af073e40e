//! In-memory `ExecutionMonitor` that keeps a start/stop history.

use chrono::{DateTime, Utc};
use cortex_core::monitor::{ExecutionMonitor, MonitorError};
use cortex_types::execution::WorkflowExecution;
use dashmap::DashMap;
use uuid::Uuid;

/// One monitored execution.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorRecord {
    pub workflow_id: String,
    pub total_tasks: u32,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct InMemoryMonitor {
    records: DashMap<Uuid, MonitorRecord>,
}

impl InMemoryMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Started and not yet stopped.
    pub fn is_monitoring(&self, execution_id: Uuid) -> bool {
        self.records
            .get(&execution_id)
            .is_some_and(|r| r.stopped_at.is_none())
    }

    pub fn active_count(&self) -> usize {
        self.records.iter().filter(|r| r.stopped_at.is_none()).count()
    }

    pub fn record(&self, execution_id: Uuid) -> Option<MonitorRecord> {
        self.records.get(&execution_id).map(|r| r.value().clone())
    }

    /// Every execution ever monitored, including stopped ones.
    pub fn history_len(&self) -> usize {
        self.records.len()
    }
}

impl ExecutionMonitor for InMemoryMonitor {
    async fn start_monitoring(&self, execution: &WorkflowExecution) -> Result<(), MonitorError> {
        self.records.insert(
            execution.id,
            MonitorRecord {
                workflow_id: execution.workflow_id.clone(),
                total_tasks: execution.metrics.total_tasks,
                started_at: Utc::now(),
                stopped_at: None,
            },
        );
        tracing::debug!(execution_id = %execution.id, "monitoring started");
        Ok(())
    }

    async fn stop_monitoring(&self, execution_id: Uuid) -> Result<(), MonitorError> {
        let mut record = self
            .records
            .get_mut(&execution_id)
            .filter(|r| r.stopped_at.is_none())
            .ok_or(MonitorError::NotMonitored(execution_id))?;
        record.stopped_at = Some(Utc::now());
        tracing::debug!(execution_id = %execution_id, "monitoring stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_types::value::ValueMap;
    use cortex_types::workflow::{Workflow, WorkflowTask};

    #[tokio::test]
    async fn tracks_start_and_stop() {
        let monitor = InMemoryMonitor::new();
        let wf = Workflow::new("etl").with_task(WorkflowTask::new("a"));
        let exec = WorkflowExecution::new(&wf, None, ValueMap::new());

        monitor.start_monitoring(&exec).await.unwrap();
        assert!(monitor.is_monitoring(exec.id));
        assert_eq!(monitor.active_count(), 1);

        monitor.stop_monitoring(exec.id).await.unwrap();
        assert!(!monitor.is_monitoring(exec.id));
        assert_eq!(monitor.history_len(), 1);
        let record = monitor.record(exec.id).unwrap();
        assert_eq!(record.workflow_id, "etl");
        assert!(record.stopped_at.is_some());
    }

    #[tokio::test]
    async fn stopping_unknown_or_stopped_execution_errors() {
        let monitor = InMemoryMonitor::new();
        let id = Uuid::now_v7();
        assert!(matches!(
            monitor.stop_monitoring(id).await,
            Err(MonitorError::NotMonitored(_))
        ));

        let wf = Workflow::new("etl").with_task(WorkflowTask::new("a"));
        let exec = WorkflowExecution::new(&wf, None, ValueMap::new());
        monitor.start_monitoring(&exec).await.unwrap();
        monitor.stop_monitoring(exec.id).await.unwrap();
        assert!(monitor.stop_monitoring(exec.id).await.is_err());
    }
}
