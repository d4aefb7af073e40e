//! Execution monitor port.
//!
//! The engine calls the monitor purely as a lifecycle hook: tracking starts
//! when an execution is created and stops when it reaches a terminal state.
//! Monitor errors are logged and never affect the run.

use cortex_types::execution::WorkflowExecution;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("execution {0} is not being monitored")]
    NotMonitored(Uuid),

    #[error("monitor backend error: {0}")]
    Backend(String),
}

/// Lifecycle hooks for execution tracking.
pub trait ExecutionMonitor: Send + Sync + 'static {
    fn start_monitoring(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), MonitorError>> + Send;

    fn stop_monitoring(
        &self,
        execution_id: Uuid,
    ) -> impl std::future::Future<Output = Result<(), MonitorError>> + Send;
}

/// Monitor that ignores every hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMonitor;

impl ExecutionMonitor for NoopMonitor {
    async fn start_monitoring(&self, _execution: &WorkflowExecution) -> Result<(), MonitorError> {
        Ok(())
    }

    async fn stop_monitoring(&self, _execution_id: Uuid) -> Result<(), MonitorError> {
        Ok(())
    }
}
