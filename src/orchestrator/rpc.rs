//! Shared bus-request/response correlation used by the default type handlers.

use crate::bus::{Event, EventBus, SubscribeOptions};
use crate::types::{Error, RequestId, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

/// Emits `request_event` with a freshly minted `requestId` merged into
/// `payload`, then awaits `result_event` carrying the same `requestId` within
/// `timeout`. Unmatched responses are ignored; on timeout the subscription is
/// cancelled and the call fails tagged with `result_event`.
pub async fn bus_request(
    bus: &Arc<Mutex<EventBus>>,
    request_event: &str,
    result_event: &str,
    mut payload: serde_json::Value,
    timeout: Duration,
) -> Result<serde_json::Value> {
    let request_id = RequestId::new().to_string();
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("requestId".to_string(), serde_json::json!(request_id));
    }

    let (tx, rx) = oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let filter_id = request_id.clone();
    let filter: Arc<dyn Fn(&Event) -> bool + Send + Sync> = Arc::new(move |event: &Event| {
        event.payload.get("requestId").and_then(|v| v.as_str()) == Some(filter_id.as_str())
    });

    let sub_id = {
        let mut guard = bus.lock().await;
        guard.subscribe(
            result_event,
            move |event: Event| {
                let tx = tx.clone();
                async move {
                    if let Some(sender) = tx.lock().await.take() {
                        let _ = sender.send(event.payload);
                    }
                    Ok(())
                }
            },
            SubscribeOptions { priority: 0, once: true, filter: Some(filter) },
        )
    };

    bus.lock().await.emit(request_event.to_string(), payload);

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => {
            if let Some(err) = result.get("error").and_then(|v| v.as_str()) {
                Err(Error::provider_error(request_event, err))
            } else {
                Ok(result)
            }
        }
        Ok(Err(_)) => Err(Error::internal(format!("{result_event} sender dropped before responding"))),
        Err(_) => {
            bus.lock().await.unsubscribe(&sub_id);
            Err(Error::request_timeout(request_id, result_event))
        }
    }
}

/// Awaits a single event of `event_type` whose payload has `key == value`,
/// without minting or injecting a `requestId` of its own. Used by handlers
/// that correlate on a pre-existing identifier (e.g. `batchId`) instead.
pub async fn await_event(
    bus: &Arc<Mutex<EventBus>>,
    event_type: &str,
    key: &str,
    value: &str,
    timeout: Duration,
) -> Result<serde_json::Value> {
    let (tx, rx) = oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let key = key.to_string();
    let value = value.to_string();
    let filter: Arc<dyn Fn(&Event) -> bool + Send + Sync> = {
        let key = key.clone();
        let value = value.clone();
        Arc::new(move |event: &Event| event.payload.get(&key).and_then(|v| v.as_str()) == Some(value.as_str()))
    };

    let sub_id = {
        let mut guard = bus.lock().await;
        guard.subscribe(
            event_type,
            move |event: Event| {
                let tx = tx.clone();
                async move {
                    if let Some(sender) = tx.lock().await.take() {
                        let _ = sender.send(event.payload);
                    }
                    Ok(())
                }
            },
            SubscribeOptions { priority: 0, once: true, filter: Some(filter) },
        )
    };

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(_)) => Err(Error::internal(format!("{event_type} sender dropped before responding"))),
        Err(_) => {
            bus.lock().await.unsubscribe(&sub_id);
            Err(Error::request_timeout(value, event_type))
        }
    }
}

/// Awaits the next occurrence of `event_type` regardless of payload, for
/// bus protocols with no per-call correlation id (e.g. a single active
/// voting window's `voting:complete`).
pub async fn await_any(bus: &Arc<Mutex<EventBus>>, event_type: &str, timeout: Duration) -> Result<serde_json::Value> {
    let (tx, rx) = oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));

    let sub_id = {
        let mut guard = bus.lock().await;
        guard.subscribe(
            event_type,
            move |event: Event| {
                let tx = tx.clone();
                async move {
                    if let Some(sender) = tx.lock().await.take() {
                        let _ = sender.send(event.payload);
                    }
                    Ok(())
                }
            },
            SubscribeOptions { priority: 0, once: true, filter: None },
        )
    };

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(_)) => Err(Error::internal(format!("{event_type} sender dropped before responding"))),
        Err(_) => {
            bus.lock().await.unsubscribe(&sub_id);
            Err(Error::request_timeout(event_type, event_type))
        }
    }
}
