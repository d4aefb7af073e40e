//! Execution events broadcast by the orchestrator.
//!
//! `ExecutionEvent` is the single event type published on the event bus.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle events for executions, batches, and tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: String,
        total_tasks: u32,
        at: DateTime<Utc>,
    },

    ExecutionCompleted {
        execution_id: Uuid,
        duration_ms: u64,
        failed_tasks: u32,
    },

    ExecutionFailed {
        execution_id: Uuid,
        error: String,
    },

    ExecutionCancelled { execution_id: Uuid },

    ExecutionPaused { execution_id: Uuid },

    ExecutionResumed { execution_id: Uuid },

    /// A batch is about to launch.
    BatchStarted {
        execution_id: Uuid,
        batch_index: usize,
        task_ids: Vec<String>,
    },

    TaskSkipped {
        execution_id: Uuid,
        task_id: String,
    },

    TaskStarted {
        execution_id: Uuid,
        task_id: String,
        agent_id: String,
        attempt: u32,
    },

    /// An attempt failed and another will follow after `delay_ms`.
    TaskRetrying {
        execution_id: Uuid,
        task_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    TaskCompleted {
        execution_id: Uuid,
        task_id: String,
        attempts: u32,
        duration_ms: u64,
    },

    TaskFailed {
        execution_id: Uuid,
        task_id: String,
        attempts: u32,
        error: String,
    },
}

impl ExecutionEvent {
    /// The execution this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            ExecutionEvent::ExecutionStarted { execution_id, .. }
            | ExecutionEvent::ExecutionCompleted { execution_id, .. }
            | ExecutionEvent::ExecutionFailed { execution_id, .. }
            | ExecutionEvent::ExecutionCancelled { execution_id }
            | ExecutionEvent::ExecutionPaused { execution_id }
            | ExecutionEvent::ExecutionResumed { execution_id }
            | ExecutionEvent::BatchStarted { execution_id, .. }
            | ExecutionEvent::TaskSkipped { execution_id, .. }
            | ExecutionEvent::TaskStarted { execution_id, .. }
            | ExecutionEvent::TaskRetrying { execution_id, .. }
            | ExecutionEvent::TaskCompleted { execution_id, .. }
            | ExecutionEvent::TaskFailed { execution_id, .. } => *execution_id,
        }
    }

    /// Short event name matching the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionEvent::ExecutionStarted { .. } => "execution_started",
            ExecutionEvent::ExecutionCompleted { .. } => "execution_completed",
            ExecutionEvent::ExecutionFailed { .. } => "execution_failed",
            ExecutionEvent::ExecutionCancelled { .. } => "execution_cancelled",
            ExecutionEvent::ExecutionPaused { .. } => "execution_paused",
            ExecutionEvent::ExecutionResumed { .. } => "execution_resumed",
            ExecutionEvent::BatchStarted { .. } => "batch_started",
            ExecutionEvent::TaskSkipped { .. } => "task_skipped",
            ExecutionEvent::TaskStarted { .. } => "task_started",
            ExecutionEvent::TaskRetrying { .. } => "task_retrying",
            ExecutionEvent::TaskCompleted { .. } => "task_completed",
            ExecutionEvent::TaskFailed { .. } => "task_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = ExecutionEvent::TaskRetrying {
            execution_id: Uuid::nil(),
            task_id: "extract".to_string(),
            attempt: 1,
            delay_ms: 100,
            error: "boom".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_retrying");
        assert_eq!(json["delay_ms"], 100);
        assert_eq!(event.kind(), "task_retrying");
    }

    #[test]
    fn execution_id_accessor_covers_unit_like_variants() {
        let id = Uuid::now_v7();
        assert_eq!(ExecutionEvent::ExecutionPaused { execution_id: id }.execution_id(), id);
        assert_eq!(
            ExecutionEvent::BatchStarted {
                execution_id: id,
                batch_index: 0,
                task_ids: vec![],
            }
            .execution_id(),
            id
        );
    }
}
