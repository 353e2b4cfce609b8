//! Event Bus — the in-process asynchronous nervous system (component A).
//!
//! A concrete value, not an inherited emitter: callers hold the bus behind
//! whatever sharing discipline they need (typically `Arc<tokio::sync::Mutex<EventBus>>`)
//! and call its methods directly, the same non-actor, owned-by-a-coordinator
//! shape the rest of this crate uses for its other subsystems.

mod pattern;

use crate::types::{EventId, Result, SubscriptionId};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use pattern::pattern_matches;

/// Default number of events retained per type in the ring-buffer history.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Event emitted published on the bus. Immutable after emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub source: Option<String>,
}

impl Event {
    fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
            source: None,
        }
    }
}

/// A single asynchronous handler invocation's outcome once it has run to
/// completion (or panicked). Surfaced via `bus:handler_error` and returned
/// from [`EventBus::emit_async`] / [`EventBus::drain_errors`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub subscription_id: SubscriptionId,
    pub event_type: String,
    pub error: String,
}

/// Per-event-type emission/delivery/error counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMetrics {
    pub emitted: u64,
    pub delivered: u64,
    pub errors: u64,
}

/// Options accepted by [`EventBus::subscribe`].
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub priority: i32,
    pub once: bool,
    pub filter: Option<Arc<dyn Fn(&Event) -> bool + Send + Sync>>,
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("priority", &self.priority)
            .field("once", &self.once)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

type HandlerFuture = BoxFuture<'static, Result<()>>;

/// Type-erased handler. Implemented for any `Fn(Event) -> impl Future<Output = Result<()>>`.
pub trait EventHandlerFn: Send + Sync + 'static {
    fn call(&self, event: Event) -> HandlerFuture;
}

impl<F, Fut> EventHandlerFn for F
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, event: Event) -> HandlerFuture {
        Box::pin((self)(event))
    }
}

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    priority: i32,
    once: bool,
    order: u64,
    filter: Option<Arc<dyn Fn(&Event) -> bool + Send + Sync>>,
    handler: Arc<dyn EventHandlerFn>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("priority", &self.priority)
            .field("once", &self.once)
            .field("order", &self.order)
            .finish()
    }
}

/// Typed pub/sub bus with ordering, wildcards, history, and metrics.
///
/// NOT a separate actor — owned by whatever component coordinates the
/// control plane and called via `&mut self` / `&self` (the bus's own mutation
/// of its subscription list happens only inside `subscribe`/`unsubscribe`).
#[derive(Debug)]
pub struct EventBus {
    subscriptions: Vec<Subscription>,
    next_order: u64,
    history: HashMap<String, VecDeque<Event>>,
    history_limit: usize,
    metrics: HashMap<String, EventMetrics>,
    error_tx: mpsc::UnboundedSender<HandlerFailure>,
    error_rx: mpsc::UnboundedReceiver<HandlerFailure>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl EventBus {
    pub fn new(history_limit: usize) -> Self {
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        Self {
            subscriptions: Vec::new(),
            next_order: 0,
            history: HashMap::new(),
            history_limit,
            metrics: HashMap::new(),
            error_tx,
            error_rx,
        }
    }

    /// Subscribe a handler to an event type or glob pattern.
    ///
    /// Higher `priority` subscriptions are delivered first; equal priority
    /// resolves by subscription order (insertion order).
    pub fn subscribe<H>(&mut self, pattern: impl Into<String>, handler: H, options: SubscribeOptions) -> SubscriptionId
    where
        H: EventHandlerFn,
    {
        let id = SubscriptionId::new();
        let order = self.next_order;
        self.next_order += 1;
        self.subscriptions.push(Subscription {
            id: id.clone(),
            pattern: pattern.into(),
            priority: options.priority,
            once: options.once,
            order,
            filter: options.filter,
            handler: Arc::new(handler),
        });
        // Kept sorted by (priority desc, order asc) so dispatch just iterates in order.
        self.subscriptions
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.order.cmp(&b.order)));
        id
    }

    /// Cancel a subscription. Idempotent: cancelling twice (or an unknown id)
    /// simply returns `false` the second time.
    pub fn unsubscribe(&mut self, id: &SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| &s.id != id);
        self.subscriptions.len() != before
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Last `limit` events recorded for an exact event type (most recent last).
    pub fn get_recent(&self, event_type: &str, limit: usize) -> Vec<Event> {
        match self.history.get(event_type) {
            None => Vec::new(),
            Some(buf) => buf.iter().rev().take(limit).rev().cloned().collect(),
        }
    }

    pub fn metrics_for(&self, event_type: &str) -> EventMetrics {
        self.metrics.get(event_type).cloned().unwrap_or_default()
    }

    /// Drain any outstanding async handler failures recorded since the last
    /// drain, publishing each as a `bus:handler_error` event. Callers that
    /// only ever use `emit_async` never need this — failures there are
    /// reported synchronously — but `emit`'s fire-and-forget handlers report
    /// back through this channel.
    pub fn drain_errors(&mut self) -> Vec<Event> {
        let mut published = Vec::new();
        while let Ok(failure) = self.error_rx.try_recv() {
            published.push(self.publish_handler_error(&failure));
        }
        published
    }

    fn publish_handler_error(&mut self, failure: &HandlerFailure) -> Event {
        let payload = serde_json::json!({
            "eventType": failure.event_type,
            "error": failure.error,
            "subscriptionId": failure.subscription_id.as_str(),
        });
        if let Some(m) = self.metrics.get_mut(&failure.event_type) {
            m.errors += 1;
        }
        self.record_and_return("bus:handler_error", payload)
    }

    fn record_and_return(&mut self, event_type: &str, payload: Value) -> Event {
        let event = Event::new(event_type, payload);
        let entry = self.metrics.entry(event_type.to_string()).or_default();
        entry.emitted += 1;
        let buf = self.history.entry(event_type.to_string()).or_default();
        buf.push_back(event.clone());
        while buf.len() > self.history_limit {
            buf.pop_front();
        }
        event
    }

    /// Snapshot the subscriptions matching `event_type` at this instant,
    /// removing any `once` matches from the live list so a handler added
    /// mid-dispatch cannot see this event, and a `once` handler cannot fire
    /// twice even under reentrant emission.
    fn take_matching(&mut self, event: &Event) -> Vec<Subscription> {
        let mut matched_once_ids = Vec::new();
        let mut matched = Vec::new();
        for sub in &self.subscriptions {
            if !pattern_matches(&sub.pattern, &event.event_type) {
                continue;
            }
            if let Some(filter) = &sub.filter {
                if !filter(event) {
                    continue;
                }
            }
            if sub.once {
                matched_once_ids.push(sub.id.clone());
            }
        }
        for id in &matched_once_ids {
            if let Some(pos) = self.subscriptions.iter().position(|s| &s.id == id) {
                matched.push(self.subscriptions.remove(pos));
            }
        }
        // Remaining (non-once) matches are cloned by reference (Arc handler, cheap clone).
        for sub in &self.subscriptions {
            if matched_once_ids.contains(&sub.id) {
                continue;
            }
            if !pattern_matches(&sub.pattern, &event.event_type) {
                continue;
            }
            if let Some(filter) = &sub.filter {
                if !filter(event) {
                    continue;
                }
            }
            matched.push(Subscription {
                id: sub.id.clone(),
                pattern: sub.pattern.clone(),
                priority: sub.priority,
                once: sub.once,
                order: sub.order,
                filter: sub.filter.clone(),
                handler: sub.handler.clone(),
            });
        }
        matched.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.order.cmp(&b.order)));
        matched
    }

    /// Emit an event. Handlers are invoked in priority/subscription order;
    /// each handler invocation is spawned onto the runtime and isolated from
    /// the others — a panicking or erroring handler reports back via
    /// [`EventBus::drain_errors`] but never blocks `emit`'s return, and never
    /// prevents delivery to the next handler in the ordering.
    pub fn emit(&mut self, event_type: impl Into<String>, payload: Value) -> Event {
        let event_type = event_type.into();
        let event = self.record_and_return(&event_type, payload);
        let matching = self.take_matching(&event);
        for sub in matching {
            if let Some(m) = self.metrics.get_mut(&event.event_type) {
                m.delivered += 1;
            }
            let handler = sub.handler.clone();
            let event_for_handler = event.clone();
            let error_tx = self.error_tx.clone();
            let sub_id = sub.id.clone();
            let event_type_for_err = event.event_type.clone();
            tokio::spawn(async move {
                let join = tokio::spawn(async move { handler.call(event_for_handler).await });
                match join.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = error_tx.send(HandlerFailure {
                            subscription_id: sub_id,
                            event_type: event_type_for_err,
                            error: err.to_string(),
                        });
                    }
                    Err(join_err) => {
                        let _ = error_tx.send(HandlerFailure {
                            subscription_id: sub_id,
                            event_type: event_type_for_err,
                            error: format!("handler panicked: {join_err}"),
                        });
                    }
                }
            });
        }
        event
    }

    /// Emit an event and wait for every matching handler to complete (or
    /// panic). Failures are isolated the same way as `emit` but reported
    /// synchronously in the returned list instead of via `drain_errors`.
    pub async fn emit_async(&mut self, event_type: impl Into<String>, payload: Value) -> (Event, Vec<HandlerFailure>) {
        let event_type = event_type.into();
        let event = self.record_and_return(&event_type, payload);
        let matching = self.take_matching(&event);
        let mut joins = Vec::with_capacity(matching.len());
        for sub in &matching {
            if let Some(m) = self.metrics.get_mut(&event.event_type) {
                m.delivered += 1;
            }
            let handler = sub.handler.clone();
            let event_for_handler = event.clone();
            joins.push((sub.id.clone(), tokio::spawn(async move { handler.call(event_for_handler).await })));
        }
        let mut failures = Vec::new();
        for (sub_id, join) in joins {
            match join.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => failures.push(HandlerFailure {
                    subscription_id: sub_id,
                    event_type: event.event_type.clone(),
                    error: err.to_string(),
                }),
                Err(join_err) => failures.push(HandlerFailure {
                    subscription_id: sub_id,
                    event_type: event.event_type.clone(),
                    error: format!("handler panicked: {join_err}"),
                }),
            }
        }
        for failure in &failures {
            self.publish_handler_error(failure);
        }
        (event, failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn ok_handler() -> impl EventHandlerFn {
        |_event: Event| async { Ok(()) }
    }

    #[tokio::test]
    async fn emit_async_delivers_to_matching_subscription() {
        let mut bus = EventBus::default();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = received.clone();
        bus.subscribe(
            "voting.*",
            move |event: Event| {
                let received = received_clone.clone();
                async move {
                    received.lock().unwrap().push(event.event_type);
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        );

        bus.emit_async("voting.opened", serde_json::json!({})).await;
        bus.emit_async("other.event", serde_json::json!({})).await;

        assert_eq!(*received.lock().unwrap(), vec!["voting.opened".to_string()]);
    }

    #[tokio::test]
    async fn priority_orders_delivery() {
        let mut bus = EventBus::default();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let order_low = order.clone();
        bus.subscribe(
            "x",
            move |_e: Event| {
                let order = order_low.clone();
                async move {
                    order.lock().unwrap().push("low");
                    Ok(())
                }
            },
            SubscribeOptions { priority: 0, ..Default::default() },
        );
        let order_high = order.clone();
        bus.subscribe(
            "x",
            move |_e: Event| {
                let order = order_high.clone();
                async move {
                    order.lock().unwrap().push("high");
                    Ok(())
                }
            },
            SubscribeOptions { priority: 10, ..Default::default() },
        );

        bus.emit_async("x", serde_json::json!({})).await;
        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn once_subscription_fires_a_single_time() {
        let mut bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        bus.subscribe(
            "x",
            move |_e: Event| {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            SubscribeOptions { once: true, ..Default::default() },
        );

        bus.emit_async("x", serde_json::json!({})).await;
        bus.emit_async("x", serde_json::json!({})).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let mut bus = EventBus::default();
        let id = bus.subscribe("x", ok_handler(), SubscribeOptions::default());
        assert!(bus.unsubscribe(&id));
        assert!(!bus.unsubscribe(&id));
    }

    #[tokio::test]
    async fn handler_error_is_isolated_and_reported() {
        let mut bus = EventBus::default();
        bus.subscribe(
            "x",
            |_e: Event| async { Err(crate::types::Error::internal("boom")) },
            SubscribeOptions::default(),
        );
        let survived = Arc::new(AtomicUsize::new(0));
        let survived_clone = survived.clone();
        bus.subscribe(
            "x",
            move |_e: Event| {
                let survived = survived_clone.clone();
                async move {
                    survived.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        );

        let (_event, failures) = bus.emit_async("x", serde_json::json!({})).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(survived.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wildcard_pattern_matches_nested_events() {
        let mut bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        bus.subscribe(
            "orchestrator.**",
            move |_e: Event| {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        );
        bus.emit_async("orchestrator.stage.complete", serde_json::json!({})).await;
        bus.emit_async("unrelated", serde_json::json!({})).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn history_ring_buffer_respects_limit() {
        let mut bus = EventBus::new(2);
        bus.emit("x", serde_json::json!(1));
        bus.emit("x", serde_json::json!(2));
        bus.emit("x", serde_json::json!(3));
        let recent = bus.get_recent("x", 10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].payload, serde_json::json!(2));
        assert_eq!(recent[1].payload, serde_json::json!(3));
    }

    #[tokio::test]
    async fn metrics_count_emissions_and_deliveries() {
        let mut bus = EventBus::default();
        bus.subscribe("x", ok_handler(), SubscribeOptions::default());
        bus.subscribe("x", ok_handler(), SubscribeOptions::default());
        bus.emit_async("x", serde_json::json!({})).await;
        let metrics = bus.metrics_for("x");
        assert_eq!(metrics.emitted, 1);
        assert_eq!(metrics.delivered, 2);
    }

    #[tokio::test]
    async fn emit_schedules_handlers_without_awaiting_them() {
        let mut bus = EventBus::default();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        bus.subscribe(
            "x",
            move |_e: Event| {
                let ran = ran_clone.clone();
                async move {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        );
        bus.emit("x", serde_json::json!({}));
        // emit() returns immediately; the handler has not necessarily run yet.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn emit_fire_and_forget_errors_surface_via_drain_errors() {
        let mut bus = EventBus::default();
        bus.subscribe(
            "x",
            |_e: Event| async { Err(crate::types::Error::internal("boom")) },
            SubscribeOptions::default(),
        );
        bus.emit("x", serde_json::json!({}));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let published = bus.drain_errors();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type, "bus:handler_error");
    }
}
