//! Event bus: typed publish/subscribe with wildcard subscriptions
//!
//! `emit` is synchronous. It normalizes the event, then runs every handler
//! registered for the concrete type followed by every wildcard handler, in
//! subscription order. Handler failures are contained: they are logged,
//! reported on the failure channel and never reach the emitter.
//!
//! Async handlers are spawned onto the current tokio runtime as supervised
//! tasks, so their completion is not ordered with respect to `emit`.

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use reflow_types::{Event, WILDCARD};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;

/// What a handler reports back to the bus
pub type HandlerResult = Result<(), String>;

type SyncHandler = Arc<dyn Fn(&Event) -> HandlerResult + Send + Sync>;
type AsyncHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

#[derive(Clone)]
struct Registration {
    id: u64,
    handler: Handler,
}

/// A handler failure contained by the bus
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerFailure {
    pub subscription_id: u64,
    pub event_type: String,
    pub message: String,
}

/// Event bus statistics
#[derive(Clone, Debug, Default)]
pub struct EventBusStats {
    /// Total events emitted
    pub total_events: u64,
    /// Events by type
    pub events_by_type: HashMap<String, u64>,
    /// Number of live subscriptions, wildcard included
    pub subscriber_count: usize,
}

struct BusInner {
    handlers: RwLock<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
    emitted: DashMap<String, u64>,
    failure_tx: Mutex<Option<mpsc::UnboundedSender<HandlerFailure>>>,
}

impl BusInner {
    fn remove(&self, event_type: &str, id: u64) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = handlers.get_mut(event_type) {
            list.retain(|r| r.id != id);
            if list.is_empty() {
                handlers.remove(event_type);
            }
        }
    }

    fn failure_sender(&self) -> Option<mpsc::UnboundedSender<HandlerFailure>> {
        self.failure_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Publish/subscribe hub shared by every engine in a runtime
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                emitted: DashMap::new(),
                failure_tx: Mutex::new(None),
            }),
        }
    }

    /// Register a synchronous handler. `"*"` subscribes to every event.
    pub fn subscribe<F>(&self, event_type: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(event_type.into(), Handler::Sync(Arc::new(handler)))
    }

    /// Register an async handler, run as a spawned task per matching event
    pub fn subscribe_async<F, Fut>(&self, event_type: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |event| handler(event).boxed());
        self.register(event_type.into(), Handler::Async(handler))
    }

    fn register(&self, event_type: String, handler: Handler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_type.clone())
            .or_default()
            .push(Registration { id, handler });

        tracing::trace!(subscription_id = id, event_type = %event_type, "Subscribed");

        Subscription {
            id,
            event_type,
            bus: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        }
    }

    /// Publish an event to every matching handler
    pub fn emit(&self, event: Event) {
        let event = event.normalized();
        *self
            .inner
            .emitted
            .entry(event.event_type.clone())
            .or_insert(0) += 1;

        // Handlers registered or removed from here on do not affect this emission
        for registration in self.matching(&event.event_type) {
            match &registration.handler {
                Handler::Sync(handler) => self.dispatch_sync(registration.id, handler, &event),
                Handler::Async(handler) => self.dispatch_async(registration.id, handler, &event),
            }
        }
    }

    fn matching(&self, event_type: &str) -> Vec<Registration> {
        let handlers = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<Registration> =
            handlers.get(event_type).cloned().unwrap_or_default();
        if event_type != WILDCARD {
            if let Some(wildcards) = handlers.get(WILDCARD) {
                matched.extend(wildcards.iter().cloned());
            }
        }
        matched
    }

    fn dispatch_sync(&self, id: u64, handler: &SyncHandler, event: &Event) {
        let message = match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => return,
            Ok(Err(message)) => message,
            Err(panic) => format!("handler panicked: {}", panic_message(&*panic)),
        };
        report_failure(
            self.inner.failure_sender().as_ref(),
            HandlerFailure {
                subscription_id: id,
                event_type: event.event_type.clone(),
                message,
            },
        );
    }

    fn dispatch_async(&self, id: u64, handler: &AsyncHandler, event: &Event) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                subscription_id = id,
                event_type = %event.event_type,
                "No tokio runtime available, async handler skipped"
            );
            return;
        };

        let handler = Arc::clone(handler);
        let event = event.clone();
        let failures = self.inner.failure_sender();
        runtime.spawn(async move {
            let event_type = event.event_type.clone();
            let outcome = AssertUnwindSafe(async move { handler(event).await })
                .catch_unwind()
                .await;
            let message = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(message)) => message,
                Err(panic) => format!("handler panicked: {}", panic_message(&*panic)),
            };
            report_failure(
                failures.as_ref(),
                HandlerFailure {
                    subscription_id: id,
                    event_type,
                    message,
                },
            );
        });
    }

    /// Take the single receiver of the failure channel.
    ///
    /// Only one receiver is live at a time: a later call closes the
    /// previous one. Failures reported before the first call are only
    /// logged.
    pub fn failures(&self) -> mpsc::UnboundedReceiver<HandlerFailure> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .inner
            .failure_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Drop every subscription
    pub fn clear(&self) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::debug!("Event bus cleared");
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Handlers registered for exactly this type (wildcards not counted)
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .map_or(0, Vec::len)
    }

    pub fn stats(&self) -> EventBusStats {
        let events_by_type: HashMap<String, u64> = self
            .inner
            .emitted
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        EventBusStats {
            total_events: events_by_type.values().sum(),
            events_by_type,
            subscriber_count: self.subscriber_count(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn report_failure(sender: Option<&mpsc::UnboundedSender<HandlerFailure>>, failure: HandlerFailure) {
    tracing::warn!(
        subscription_id = failure.subscription_id,
        event_type = %failure.event_type,
        error = %failure.message,
        "Event handler failed"
    );
    if let Some(sender) = sender {
        // Receiver gone: nobody is listening, the log line is enough
        let _ = sender.send(failure);
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Handle returned by `subscribe`. Dropping it keeps the subscription.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    event_type: String,
    bus: Weak<BusInner>,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop delivery to this handler. Idempotent.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.event_type, self.id);
            tracing::trace!(subscription_id = self.id, event_type = %self.event_type, "Unsubscribed");
        }
    }
}

impl std::fmt::Debug for BusInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusInner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Event) -> HandlerResult + Send + Sync) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move |_: &Event| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_subscribe_emit_unsubscribe() {
        let bus = EventBus::new();
        let (count, handler) = counter();
        let sub = bus.subscribe("order.placed", handler);

        bus.emit(Event::new("order.placed"));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());

        bus.emit(Event::new("order.placed"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_wildcard_sees_every_event_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        let _wild = bus.subscribe(WILDCARD, move |e| {
            s.lock().unwrap().push(format!("*:{}", e.event_type));
            Ok(())
        });
        let s = Arc::clone(&seen);
        let _typed = bus.subscribe("A", move |e| {
            s.lock().unwrap().push(format!("A:{}", e.event_type));
            Ok(())
        });

        bus.emit(Event::new("A"));
        bus.emit(Event::new("B"));

        assert_eq!(*seen.lock().unwrap(), vec!["A:A", "*:A", "*:B"]);
    }

    #[test]
    fn test_wildcard_event_not_delivered_twice() {
        let bus = EventBus::new();
        let (count, handler) = counter();
        let _sub = bus.subscribe(WILDCARD, handler);

        bus.emit(Event::new(WILDCARD));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_handlers_are_contained() {
        let bus = EventBus::new();
        let mut failures = bus.failures();
        let (count, handler) = counter();

        let bad = bus.subscribe("x", |_| Err("nope".to_string()));
        let _panics = bus.subscribe("x", |_| panic!("kaboom"));
        let _good = bus.subscribe("x", handler);

        bus.emit(Event::new("x"));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let first = failures.try_recv().unwrap();
        assert_eq!(first.subscription_id, bad.id());
        assert_eq!(first.message, "nope");
        let second = failures.try_recv().unwrap();
        assert!(second.message.contains("kaboom"));
        assert!(failures.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_during_emit_defers_to_next_emission() {
        let bus = EventBus::new();
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let v = Arc::clone(&victim);
        let _killer = bus.subscribe("tick", move |_| {
            if let Some(sub) = v.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
            Ok(())
        });
        let (count, handler) = counter();
        *victim.lock().unwrap() = Some(bus.subscribe("tick", handler));

        bus.emit(Event::new("tick"));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        bus.emit(Event::new("tick"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nested_emit_sees_unsubscribe() {
        let bus = EventBus::new();
        let (count, handler) = counter();
        let target = Arc::new(bus.subscribe("inner", handler));

        let nested_bus = bus.clone();
        let t = Arc::clone(&target);
        let _outer = bus.subscribe("outer", move |_| {
            t.unsubscribe();
            nested_bus.emit(Event::new("inner"));
            Ok(())
        });

        bus.emit(Event::new("outer"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_emit_fills_timestamp_and_counts() {
        let bus = EventBus::new();
        let stamped = Arc::new(Mutex::new(None));
        let s = Arc::clone(&stamped);
        let _sub = bus.subscribe("a", move |e| {
            *s.lock().unwrap() = e.timestamp;
            Ok(())
        });

        bus.emit(Event::new("a").with_payload(json!({"n": 1})));
        bus.emit(Event::new("b"));

        assert!(stamped.lock().unwrap().is_some());
        let stats = bus.stats();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.events_by_type.get("a"), Some(&1));
        assert_eq!(stats.subscriber_count, 1);
        assert_eq!(bus.listener_count("a"), 1);

        bus.clear();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_async_handlers_are_supervised() {
        let bus = EventBus::new();
        let mut failures = bus.failures();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _ok = bus.subscribe_async("job", move |event: Event| {
            let tx = tx.clone();
            async move {
                tx.send(event.payload).map_err(|e| e.to_string())?;
                Ok::<(), String>(())
            }
        });
        let failing = bus.subscribe_async("job", |_event: Event| async move {
            Err::<(), _>("async failure".to_string())
        });

        bus.emit(Event::new("job").with_payload(json!({"id": 7})));

        assert_eq!(rx.recv().await, Some(json!({"id": 7})));
        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.subscription_id, failing.id());
        assert_eq!(failure.event_type, "job");
    }

    #[test]
    fn test_async_handler_without_runtime_is_skipped() {
        let bus = EventBus::new();
        let _sub = bus.subscribe_async("job", |_event: Event| async move { Ok(()) });
        // Must not panic outside a tokio runtime
        bus.emit(Event::new("job"));
    }
}
