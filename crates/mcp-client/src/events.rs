//! Typed push-event bus.
//!
//! Handlers subscribe per [`EventCategory`] and get a [`Subscription`] back
//! for explicit removal. Transport push streams are attached with
//! [`EventBus::attach`]: each raw event is parsed once at this boundary,
//! shown to an internal hook (the connection manager), then dispatched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use mcp_protocol::{ErrorEvent, EventCategory, McpEvent};
use mcp_transport::RawPushEvent;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// An event handler. Handlers run on the pump task and should not block.
pub type Handler = Arc<dyn Fn(&McpEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    handlers: RwLock<HashMap<EventCategory, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Cheap to clone; clones share the same subscriber lists.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Handle returned by [`EventBus::subscribe`].
#[must_use = "dropping a Subscription keeps the handler registered; call unsubscribe() to remove it"]
pub struct Subscription {
    id: u64,
    category: EventCategory,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn category(&self) -> EventCategory {
        self.category
    }

    /// Remove the handler. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(bus) = self.bus.upgrade() else {
            return false;
        };
        let mut handlers = bus.handlers.write();
        let Some(list) = handlers.get_mut(&self.category) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != self.id);
        before != list.len()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `category`.
    ///
    /// On a closed bus the handler is not registered and the returned
    /// subscription is inert.
    pub fn subscribe<F>(&self, category: EventCategory, handler: F) -> Subscription
    where
        F: Fn(&McpEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if self.is_closed() {
            warn!("Subscription to {} on a closed event bus ignored", category.as_str());
        } else {
            self.inner
                .handlers
                .write()
                .entry(category)
                .or_default()
                .push((id, Arc::new(handler)));
        }
        Subscription {
            id,
            category,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every handler of its category.
    pub fn publish(&self, event: &McpEvent) {
        publish(&self.inner, event);
    }

    /// Pump a transport subscription into the bus.
    ///
    /// `hook` sees every event before subscribers do.
    pub fn attach<H>(&self, mut receiver: broadcast::Receiver<RawPushEvent>, hook: H)
    where
        H: Fn(&McpEvent) + Send + Sync + 'static,
    {
        if self.is_closed() {
            warn!("Not attaching a push stream to a closed event bus");
            return;
        }

        let bus = Arc::downgrade(&self.inner);
        let pump = tokio::spawn(async move {
            loop {
                let raw = match receiver.recv().await {
                    Ok(raw) => raw,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event bus lagged, {skipped} push events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let event = match McpEvent::parse(raw.category, &raw.payload) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!("{err}");
                        McpEvent::Error(ErrorEvent::from(err))
                    }
                };

                let Some(live) = bus.upgrade() else { break };
                if live.closed.load(Ordering::Acquire) {
                    break;
                }
                hook(&event);
                publish(&live, &event);
            }
            debug!("Push event pump stopped");
        });
        self.inner.pumps.lock().push(pump);
    }

    /// Stop all pumps, drop every handler, and close the bus.
    pub fn cleanup(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let pumps: Vec<_> = self.inner.pumps.lock().drain(..).collect();
        for pump in &pumps {
            pump.abort();
        }
        self.inner.handlers.write().clear();
        info!("Event bus closed ({} push streams detached)", pumps.len());
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Total number of registered handlers.
    pub fn listener_count(&self) -> usize {
        self.inner.handlers.read().values().map(Vec::len).sum()
    }

    pub fn listener_count_for(&self, category: EventCategory) -> usize {
        self.inner.handlers.read().get(&category).map_or(0, Vec::len)
    }

    /// Number of attached push streams still running.
    pub fn pump_count(&self) -> usize {
        self.inner.pumps.lock().iter().filter(|p| !p.is_finished()).count()
    }
}

fn publish(inner: &BusInner, event: &McpEvent) {
    if inner.closed.load(Ordering::Acquire) {
        return;
    }
    // Handlers may (un)subscribe, so call them outside the lock.
    let handlers: Vec<Handler> = match inner.handlers.read().get(&event.category()) {
        Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
        None => return,
    };
    for handler in handlers {
        handler(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use mcp_protocol::{ConnectionStateEvent, ErrorCode};

    use super::*;

    fn counter(bus: &EventBus, category: EventCategory) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = bus.subscribe(category, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, sub)
    }

    fn connected_event() -> McpEvent {
        McpEvent::ConnectionState(ConnectionStateEvent {
            connected: true,
            server_name: None,
        })
    }

    #[test]
    fn publish_reaches_only_matching_category() {
        let bus = EventBus::new();
        let (state_count, _s1) = counter(&bus, EventCategory::ConnectionState);
        let (error_count, _s2) = counter(&bus, EventCategory::Error);

        bus.publish(&connected_event());

        assert_eq!(state_count.load(Ordering::SeqCst), 1);
        assert_eq!(error_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let bus = EventBus::new();
        let (count, sub) = counter(&bus, EventCategory::ConnectionState);
        assert_eq!(bus.listener_count(), 1);

        assert!(sub.unsubscribe());
        bus.publish(&connected_event());

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn handler_may_subscribe_during_dispatch() {
        let bus = EventBus::new();
        let inner_bus = bus.clone();
        let _sub = bus.subscribe(EventCategory::ConnectionState, move |_| {
            let _nested = inner_bus.subscribe(EventCategory::Error, |_| {});
        });

        bus.publish(&connected_event());

        assert_eq!(bus.listener_count_for(EventCategory::Error), 1);
    }

    #[tokio::test]
    async fn attached_stream_parses_and_hooks_before_dispatch() {
        let bus = EventBus::new();
        let (tx, rx) = broadcast::channel(8);
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        let _sub = bus.subscribe(EventCategory::Error, move |event| {
            if let McpEvent::Error(e) = event {
                o.lock().push(format!("handler:{}", e.code));
            }
        });
        let o = order.clone();
        bus.attach(rx, move |event| {
            if let McpEvent::Error(e) = event {
                o.lock().push(format!("hook:{}", e.code));
            }
        });

        tx.send(RawPushEvent::new(EventCategory::Error, r#"{"code":"connection_lost","message":"x"}"#))
            .unwrap();
        tx.send(RawPushEvent::new(EventCategory::ToolCall, "not json")).unwrap();
        drop(tx);

        // The pump ends once the sender is gone.
        while bus.pump_count() > 0 {
            tokio::task::yield_now().await;
        }

        let malformed = ErrorCode::MalformedPayload.as_str();
        assert_eq!(
            *order.lock(),
            vec![
                "hook:connection_lost".to_string(),
                "handler:connection_lost".to_string(),
                format!("hook:{malformed}"),
                format!("handler:{malformed}"),
            ]
        );
    }

    #[tokio::test]
    async fn cleanup_detaches_everything() {
        let bus = EventBus::new();
        let (tx, rx) = broadcast::channel(8);
        let (count, _sub) = counter(&bus, EventCategory::ConnectionState);
        bus.attach(rx, |_| {});

        bus.cleanup();
        for _ in 0..10 {
            if tx.receiver_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }

        let _ = tx.send(RawPushEvent::new(EventCategory::ConnectionState, r#"{"connected":true}"#));
        tokio::task::yield_now().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count(), 0);
        assert_eq!(bus.pump_count(), 0);
        assert_eq!(tx.receiver_count(), 0);
        assert!(bus.is_closed());
    }
}
