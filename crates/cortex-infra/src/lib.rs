//! Infrastructure layer for Cortex.
//!
//! Contains implementations of the ports defined in `cortex-core`: an
//! in-memory workflow repository, a local in-process agent coordinator, an
//! in-memory execution monitor, and the TOML configuration loader.

pub mod config;
pub mod memory;

pub use memory::{InMemoryMonitor, InMemoryWorkflowRepository, LocalAgentCoordinator};
