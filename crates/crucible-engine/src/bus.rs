//! Per-orchestrator event bus.
//!
//! Two delivery paths share one publish call:
//!
//! - **Handlers** (lifecycle hooks): synchronous, order-preserving
//!   fan-out. `emit` awaits each handler in subscription order; a handler
//!   error stops the fan-out and propagates to the emit point, which is
//!   how Sync abort-policy hooks abort the loop. Dispatch iterates a
//!   snapshot of the subscriber list, so a handler may unsubscribe anyone
//!   (itself included) mid-dispatch without crashing the publisher.
//! - **Watchers** (live stream consumers): a non-blocking broadcast tap.
//!   Lagging receivers lose events rather than ever blocking the loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crucible_core::events::{EventKind, ExperimentEvent};

use crate::errors::EngineError;

/// Watch channel capacity; slow consumers beyond this lag and drop.
const TAP_CAPACITY: usize = 1024;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ExperimentEvent) -> Result<(), EngineError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: u64,
    kind: Option<EventKind>,
    handler: Arc<dyn EventHandler>,
}

pub struct EventBus {
    subscribers: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    tap: broadcast::Sender<ExperimentEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            tap,
        }
    }

    /// Register a handler. `kind: None` receives every event.
    pub fn subscribe(
        &self,
        kind: Option<EventKind>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Subscription { id, kind, handler });
        SubscriptionId(id)
    }

    /// Remove a handler. Safe to call at any time, including from inside
    /// a handler invocation.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().retain(|s| s.id != id.0);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Attach a live consumer. The receiver sees all events emitted after
    /// this call until it is dropped.
    pub fn watch(&self) -> broadcast::Receiver<ExperimentEvent> {
        self.tap.subscribe()
    }

    pub fn watcher_count(&self) -> usize {
        self.tap.receiver_count()
    }

    /// Publish: tap first (never blocks), then handlers in subscription
    /// order. The first handler error stops the fan-out and propagates.
    pub async fn emit(&self, event: &ExperimentEvent) -> Result<(), EngineError> {
        let _ = self.tap.send(event.clone());

        let matching: Vec<Arc<dyn EventHandler>> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .iter()
                .filter(|s| s.kind.is_none() || s.kind == Some(event.kind()))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        for handler in matching {
            handler.handle(event).await?;
        }
        Ok(())
    }

    /// Publish to watchers only, skipping handlers. Used for failure
    /// logging inside LOG-bound hooks, where handler dispatch would
    /// recurse.
    pub fn emit_tap_only(&self, event: &ExperimentEvent) {
        let _ = self.tap.send(event.clone());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::ids::ExperimentId;
    use parking_lot::Mutex as PlMutex;

    fn step_event(step: u32) -> ExperimentEvent {
        ExperimentEvent::StepStart {
            experiment_id: ExperimentId::from_raw("exp_test"),
            step,
        }
    }

    fn role_event() -> ExperimentEvent {
        ExperimentEvent::RoleStart {
            experiment_id: ExperimentId::from_raw("exp_test"),
            role: "Trader".into(),
        }
    }

    struct Recorder {
        label: &'static str,
        log: Arc<PlMutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, _event: &ExperimentEvent) -> Result<(), EngineError> {
            self.log.lock().push(self.label);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _event: &ExperimentEvent) -> Result<(), EngineError> {
            Err(EngineError::Hook("abort".into()))
        }
    }

    #[tokio::test]
    async fn fan_out_preserves_subscription_order() {
        let bus = EventBus::new();
        let log = Arc::new(PlMutex::new(Vec::new()));
        let _ = bus.subscribe(None, Arc::new(Recorder { label: "first", log: log.clone() }));
        let _ = bus.subscribe(None, Arc::new(Recorder { label: "second", log: log.clone() }));
        let _ = bus.subscribe(None, Arc::new(Recorder { label: "third", log: log.clone() }));

        bus.emit(&step_event(0)).await.unwrap();
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn kind_filter_applies() {
        let bus = EventBus::new();
        let log = Arc::new(PlMutex::new(Vec::new()));
        let _ = bus.subscribe(
            Some(EventKind::StepStart),
            Arc::new(Recorder { label: "steps", log: log.clone() }),
        );

        bus.emit(&role_event()).await.unwrap();
        assert!(log.lock().is_empty());

        bus.emit(&step_event(1)).await.unwrap();
        assert_eq!(*log.lock(), vec!["steps"]);
    }

    #[tokio::test]
    async fn handler_error_stops_fan_out_and_propagates() {
        let bus = EventBus::new();
        let log = Arc::new(PlMutex::new(Vec::new()));
        let _ = bus.subscribe(None, Arc::new(Recorder { label: "before", log: log.clone() }));
        let _ = bus.subscribe(None, Arc::new(Failing));
        let _ = bus.subscribe(None, Arc::new(Recorder { label: "after", log: log.clone() }));

        let err = bus.emit(&step_event(0)).await.unwrap_err();
        assert!(matches!(err, EngineError::Hook(_)));
        // The handler behind the failing one never ran.
        assert_eq!(*log.lock(), vec!["before"]);
    }

    #[tokio::test]
    async fn unsubscribe_during_dispatch_is_safe() {
        struct SelfRemover {
            bus: Arc<EventBus>,
            own_id: PlMutex<Option<SubscriptionId>>,
            calls: Arc<PlMutex<u32>>,
        }

        #[async_trait]
        impl EventHandler for SelfRemover {
            async fn handle(&self, _event: &ExperimentEvent) -> Result<(), EngineError> {
                *self.calls.lock() += 1;
                if let Some(id) = self.own_id.lock().take() {
                    self.bus.unsubscribe(id);
                }
                Ok(())
            }
        }

        let bus = Arc::new(EventBus::new());
        let calls = Arc::new(PlMutex::new(0));
        let handler = Arc::new(SelfRemover {
            bus: Arc::clone(&bus),
            own_id: PlMutex::new(None),
            calls: calls.clone(),
        });
        let id = bus.subscribe(None, handler.clone());
        *handler.own_id.lock() = Some(id);

        bus.emit(&step_event(0)).await.unwrap();
        bus.emit(&step_event(1)).await.unwrap();

        // Handled the first event, unsubscribed itself, missed the second.
        assert_eq!(*calls.lock(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn watch_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.watch();

        bus.emit(&step_event(3)).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::StepStart);
    }

    #[tokio::test]
    async fn emit_without_watchers_or_handlers_succeeds() {
        let bus = EventBus::new();
        bus.emit(&step_event(0)).await.unwrap();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.watcher_count(), 0);
    }

    #[tokio::test]
    async fn tap_only_skips_handlers() {
        let bus = EventBus::new();
        let log = Arc::new(PlMutex::new(Vec::new()));
        let _ = bus.subscribe(None, Arc::new(Recorder { label: "handler", log: log.clone() }));
        let mut rx = bus.watch();

        bus.emit_tap_only(&step_event(0));
        assert!(log.lock().is_empty());
        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::StepStart);
    }

    #[tokio::test]
    async fn watcher_drop_detaches_cleanly() {
        let bus = EventBus::new();
        let rx = bus.watch();
        assert_eq!(bus.watcher_count(), 1);
        drop(rx);
        assert_eq!(bus.watcher_count(), 0);
        // Emitting after the only watcher disconnected still succeeds.
        bus.emit(&step_event(0)).await.unwrap();
    }
}
