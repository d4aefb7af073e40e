use thiserror::Error;

/// Errors from storage operations (repository layer).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("record not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors from agent selection and task delegation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    #[error("no available agents")]
    NoAgents,

    #[error("no agents match selection criteria")]
    NoMatchingAgents,

    #[error("agent {agent_id} is at maximum capacity ({max_tasks} tasks)")]
    AtCapacity { agent_id: String, max_tasks: u32 },

    #[error("agent {agent_id} health score {score:.2} is below threshold {threshold:.2}")]
    Unhealthy {
        agent_id: String,
        score: f64,
        threshold: f64,
    },

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    /// The agent ran the task and it failed.
    #[error("{0}")]
    Execution(String),
}
