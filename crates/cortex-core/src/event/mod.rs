//! Execution event distribution.
//!
//! - `bus` -- broadcast `EventBus` for `ExecutionEvent`
//! - `dispatcher` -- bounded fan-out of bus events to registered handlers

pub mod bus;
pub mod dispatcher;

pub use bus::EventBus;
pub use dispatcher::{EventDispatcher, EventHandler, EventHandlerError};
