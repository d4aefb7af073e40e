//! Agent filtering and strategy-based selection.
//!
//! Pure functions over `(Agent, AgentLoad)` pairs so that any coordinator
//! implementation can share them.

use std::sync::atomic::{AtomicUsize, Ordering};

use cortex_types::agent::{Agent, AgentLoad, AgentSelectionStrategy, AgentSelector};

/// An agent paired with its latest load snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub agent: Agent,
    pub load: AgentLoad,
}

impl Candidate {
    pub fn new(agent: Agent, load: AgentLoad) -> Self {
        Self { agent, load }
    }
}

/// Keep the candidates that satisfy every constraint in `selector`.
///
/// Constraints: named agents, pool membership, tag equality, required
/// capabilities, and minimum health score (when `health_threshold > 0`).
pub fn filter_candidates(candidates: Vec<Candidate>, selector: &AgentSelector) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|c| {
            selector.specific_agents.is_empty() || selector.specific_agents.contains(&c.agent.id)
        })
        .filter(|c| match &selector.pool_id {
            Some(pool) => c.agent.pool_id.as_ref() == Some(pool),
            None => true,
        })
        .filter(|c| {
            selector
                .tags
                .iter()
                .all(|(key, value)| c.agent.tags.get(key) == Some(value))
        })
        .filter(|c| c.agent.has_capabilities(&selector.required_capabilities))
        .filter(|c| selector.health_threshold <= 0.0 || c.load.health_score >= selector.health_threshold)
        .collect()
}

/// Order candidates by `strategy` and take the first `count`.
///
/// `cursor` is the round-robin position shared across calls.
pub fn select_by_strategy(
    mut candidates: Vec<Candidate>,
    strategy: AgentSelectionStrategy,
    count: usize,
    cursor: &AtomicUsize,
) -> Vec<Agent> {
    if count == 0 || candidates.is_empty() {
        return Vec::new();
    }
    let count = count.min(candidates.len());

    match strategy {
        AgentSelectionStrategy::RoundRobin => {
            let len = candidates.len();
            let start = cursor.fetch_add(count, Ordering::Relaxed) % len;
            (0..count)
                .map(|i| candidates[(start + i) % len].agent.clone())
                .collect()
        }
        AgentSelectionStrategy::LeastLoaded => {
            candidates.sort_by_key(|c| c.load.total_tasks());
            take_agents(candidates, count)
        }
        AgentSelectionStrategy::HealthAware => {
            candidates.sort_by(|a, b| b.load.health_score.total_cmp(&a.load.health_score));
            take_agents(candidates, count)
        }
        AgentSelectionStrategy::Specific | AgentSelectionStrategy::CapabilityBased => {
            take_agents(candidates, count)
        }
    }
}

fn take_agents(candidates: Vec<Candidate>, count: usize) -> Vec<Agent> {
    candidates.into_iter().take(count).map(|c| c.agent).collect()
}
