//! Bounded fan-out of execution events to registered handlers.
//!
//! A forwarder task moves events from the broadcast bus into one bounded
//! queue; a fixed pool of workers drains the queue and invokes every handler
//! for each event. A full queue applies backpressure to the forwarder
//! instead of spawning more work. Handler errors and panics are logged and
//! never take a worker down.
//!
//! Handlers use the same blanket-impl pattern as other object-safe ports:
//! 1. `EventHandler` uses native async fn in traits
//! 2. `EventHandlerDyn` is the object-safe version with boxed futures
//! 3. Every `EventHandler` is automatically an `EventHandlerDyn`

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cortex_types::event::ExecutionEvent;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::bus::EventBus;

// ---------------------------------------------------------------------------
// Handler traits
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct EventHandlerError(pub String);

/// Receives execution events from the dispatcher.
pub trait EventHandler: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    fn handle(
        &self,
        event: &ExecutionEvent,
    ) -> impl Future<Output = Result<(), EventHandlerError>> + Send;
}

/// Object-safe version of [`EventHandler`] with boxed futures.
pub trait EventHandlerDyn: Send + Sync {
    fn name(&self) -> &str;

    fn handle_boxed<'a>(
        &'a self,
        event: &'a ExecutionEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventHandlerError>> + Send + 'a>>;
}

impl<T: EventHandler> EventHandlerDyn for T {
    fn name(&self) -> &str {
        EventHandler::name(self)
    }

    fn handle_boxed<'a>(
        &'a self,
        event: &'a ExecutionEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventHandlerError>> + Send + 'a>> {
        Box::pin(self.handle(event))
    }
}

// ---------------------------------------------------------------------------
// EventDispatcher
// ---------------------------------------------------------------------------

/// Supervised worker pool delivering bus events to handlers.
pub struct EventDispatcher {
    cancel: CancellationToken,
    tracker: TaskTracker,
    workers: usize,
}

impl EventDispatcher {
    /// Subscribe to `bus` and start `workers` workers behind a queue of
    /// `queue_capacity` events.
    pub fn spawn(
        bus: &EventBus,
        handlers: Vec<Arc<dyn EventHandlerDyn>>,
        workers: usize,
        queue_capacity: usize,
    ) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<ExecutionEvent>(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let handlers: Arc<[Arc<dyn EventHandlerDyn>]> = handlers.into();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let subscription = bus.subscribe();
        tracker.spawn(forward(subscription, tx, cancel.clone()));

        for worker in 0..workers {
            let rx = rx.clone();
            let handlers = handlers.clone();
            tracker.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(event) = next else { break };
                    dispatch(worker, &handlers, event).await;
                }
                tracing::debug!(worker, "event worker stopped");
            });
        }
        tracker.close();

        tracing::debug!(workers, queue_capacity, "event dispatcher started");
        Self {
            cancel,
            tracker,
            workers,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Stop accepting bus events, drain what is already buffered, and join
    /// every worker.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.wait().await;
        tracing::debug!("event dispatcher stopped");
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("workers", &self.workers)
            .finish()
    }
}

/// Move events from the broadcast subscription into the bounded queue.
async fn forward(
    mut subscription: broadcast::Receiver<ExecutionEvent>,
    tx: mpsc::Sender<ExecutionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = subscription.recv() => received,
        };
        match received {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event dispatcher lagged behind the bus");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }

    // Cancelled: flush whatever the bus already buffered for us.
    while let Ok(event) = subscription.try_recv() {
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

/// Deliver one event to every handler, isolating each call in its own task.
async fn dispatch(worker: usize, handlers: &[Arc<dyn EventHandlerDyn>], event: ExecutionEvent) {
    for handler in handlers {
        let name = handler.name().to_string();
        let handler = handler.clone();
        let delivered = event.clone();
        let outcome = tokio::spawn(async move { handler.handle_boxed(&delivered).await }).await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    worker,
                    handler = name.as_str(),
                    event = event.kind(),
                    error = %e,
                    "event handler failed"
                );
            }
            Err(join_error) if join_error.is_panic() => {
                tracing::error!(
                    worker,
                    handler = name.as_str(),
                    event = event.kind(),
                    "event handler panicked"
                );
            }
            Err(join_error) => {
                tracing::warn!(
                    worker,
                    handler = name.as_str(),
                    error = %join_error,
                    "event handler task cancelled"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct Counting {
        seen: Arc<AtomicUsize>,
    }

    impl EventHandler for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn handle(&self, _event: &ExecutionEvent) -> Result<(), EventHandlerError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    impl EventHandler for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn handle(&self, _event: &ExecutionEvent) -> Result<(), EventHandlerError> {
            Err(EventHandlerError("sink unavailable".into()))
        }
    }

    struct Panicking;

    impl EventHandler for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn handle(&self, _event: &ExecutionEvent) -> Result<(), EventHandlerError> {
            panic!("handler bug");
        }
    }

    fn paused(id: Uuid) -> ExecutionEvent {
        ExecutionEvent::ExecutionPaused { execution_id: id }
    }

    #[tokio::test]
    async fn delivers_every_event_to_every_handler() {
        let bus = EventBus::new(64);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let dispatcher = EventDispatcher::spawn(
            &bus,
            vec![
                Arc::new(Counting { seen: first.clone() }),
                Arc::new(Counting { seen: second.clone() }),
            ],
            3,
            8,
        );

        let id = Uuid::now_v7();
        for _ in 0..20 {
            bus.publish(paused(id));
        }
        dispatcher.shutdown().await;

        assert_eq!(first.load(Ordering::SeqCst), 20);
        assert_eq!(second.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_are_isolated() {
        let bus = EventBus::new(64);
        let seen = Arc::new(AtomicUsize::new(0));
        let dispatcher = EventDispatcher::spawn(
            &bus,
            vec![
                Arc::new(Failing),
                Arc::new(Panicking),
                Arc::new(Counting { seen: seen.clone() }),
            ],
            2,
            4,
        );

        let id = Uuid::now_v7();
        for _ in 0..5 {
            bus.publish(paused(id));
        }
        dispatcher.shutdown().await;

        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn zero_workers_is_clamped_to_one() {
        let bus = EventBus::new(4);
        let dispatcher = EventDispatcher::spawn(&bus, vec![], 0, 0);
        assert_eq!(dispatcher.worker_count(), 1);
        dispatcher.shutdown().await;
    }
}
