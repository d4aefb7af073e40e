//! Per-run control handle: cooperative cancellation plus a pause gate.
//!
//! The scheduler consults the gate before every batch. Pausing never
//! interrupts a batch that is already running; it holds the next one until
//! the run is resumed or cancelled.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Shared cancel/pause state for one execution.
#[derive(Debug, Clone)]
pub struct RunControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Use `cancel` as the run's token, typically a child of an engine-wide token.
    pub fn with_token(cancel: CancellationToken) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel,
            paused: Arc::new(paused),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Close the gate. Returns `false` if it was already closed.
    pub fn pause(&self) -> bool {
        !self.paused.send_replace(true)
    }

    /// Open the gate. Returns `false` if it was already open.
    pub fn resume(&self) -> bool {
        self.paused.send_replace(false)
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Wait until the gate is open.
    ///
    /// Returns `false` if the run was cancelled before (or while) waiting.
    pub async fn wait_while_paused(&self) -> bool {
        let mut gate = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*gate.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = gate.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}
