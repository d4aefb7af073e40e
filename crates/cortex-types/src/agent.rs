//! Agent descriptors, selection criteria, and load snapshots.
//!
//! Agents are the workers that actually perform tasks. The orchestrator only
//! sees them through these types and the `AgentCoordinator` port in
//! `cortex-core`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::ResourceUsage;
use crate::value::ValueMap;

/// How agents are chosen for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentSelectionStrategy {
    /// Rotate through matching agents.
    RoundRobin,
    /// Prefer agents with the fewest active + queued tasks.
    #[default]
    LeastLoaded,
    /// Only the agents named in `specific_agents`.
    Specific,
    /// Any agent that has all required capabilities.
    CapabilityBased,
    /// Prefer agents with the highest health score.
    HealthAware,
}

impl AgentSelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentSelectionStrategy::RoundRobin => "round_robin",
            AgentSelectionStrategy::LeastLoaded => "least_loaded",
            AgentSelectionStrategy::Specific => "specific",
            AgentSelectionStrategy::CapabilityBased => "capability_based",
            AgentSelectionStrategy::HealthAware => "health_aware",
        }
    }
}

impl std::fmt::Display for AgentSelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Criteria used to pick agents for a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSelector {
    /// Selection strategy. `None` falls back to the orchestrator default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<AgentSelectionStrategy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub specific_agents: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<String>,
    /// Every tag listed here must be present on the agent with the same value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Minimum health score in `[0, 1]`; `0` disables the check.
    #[serde(default)]
    pub health_threshold: f64,
}

/// A worker that can be assigned tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<String>,
}

impl Agent {
    /// Create an agent with just an id (name defaults to the id).
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            capabilities: Vec::new(),
            tags: BTreeMap::new(),
            pool_id: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_pool(mut self, pool_id: impl Into<String>) -> Self {
        self.pool_id = Some(pool_id.into());
        self
    }

    /// Whether this agent advertises every capability in `required`.
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|cap| self.capabilities.contains(cap))
    }
}

/// Point-in-time load information for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLoad {
    pub agent_id: String,
    pub active_tasks: u32,
    pub queued_tasks: u32,
    /// CPU utilisation percentage.
    pub cpu_usage: f64,
    /// Memory utilisation percentage.
    pub memory_usage: f64,
    /// Health score in `[0, 1]`.
    pub health_score: f64,
    pub capabilities: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl AgentLoad {
    /// An idle, fully healthy load record.
    pub fn idle(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            active_tasks: 0,
            queued_tasks: 0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            health_score: 1.0,
            capabilities: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Active plus queued tasks.
    pub fn total_tasks(&self) -> u32 {
        self.active_tasks + self.queued_tasks
    }
}

/// What an agent hands back after successfully performing a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub output: ValueMap,
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    #[serde(default)]
    pub logs: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_serializes_snake_case() {
        let json = serde_json::to_string(&AgentSelectionStrategy::CapabilityBased).unwrap();
        assert_eq!(json, "\"capability_based\"");
        let parsed: AgentSelectionStrategy = serde_json::from_str("\"health_aware\"").unwrap();
        assert_eq!(parsed, AgentSelectionStrategy::HealthAware);
    }

    #[test]
    fn selector_defaults_from_empty_object() {
        let selector: AgentSelector = serde_json::from_str("{}").unwrap();
        assert!(selector.strategy.is_none());
        assert!(selector.specific_agents.is_empty());
        assert_eq!(selector.health_threshold, 0.0);
    }

    #[test]
    fn agent_capability_check() {
        let agent = Agent::new("a1").with_capabilities(["http", "etl"]);
        assert!(agent.has_capabilities(&["etl".to_string()]));
        assert!(!agent.has_capabilities(&["gpu".to_string()]));
        assert!(agent.has_capabilities(&[]));
        assert_eq!(agent.name, "a1");
    }

    #[test]
    fn idle_load_is_healthy() {
        let load = AgentLoad::idle("a1");
        assert_eq!(load.total_tasks(), 0);
        assert_eq!(load.health_score, 1.0);
    }
}
