//! Agent coordination port and selection strategies.
//!
//! - `coordinator` -- the `AgentCoordinator` trait the scheduler delegates work to
//! - `selector` -- candidate filtering and strategy-based ordering

pub mod coordinator;
pub mod selector;

pub use coordinator::{AgentCoordinator, TaskAssignment};
