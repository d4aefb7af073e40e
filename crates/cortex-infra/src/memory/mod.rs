//! In-process adapters for the `cortex-core` ports.
//!
//! Nothing here survives a restart; these back the CLI and tests.

pub mod coordinator;
pub mod monitor;
pub mod repository;

pub use coordinator::{EchoHandler, LocalAgentCoordinator, TaskHandler, TaskHandlerDyn};
pub use monitor::InMemoryMonitor;
pub use repository::InMemoryWorkflowRepository;
