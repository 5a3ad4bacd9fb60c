use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

/// The fixed topic vocabulary every publisher and subscriber shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ForwardStarting,
    ForwardConnected,
    ForwardDisconnected,
    ForwardReconnecting,
    ForwardStopped,
    ForwardError,
    HealthStatusChanged,
    HealthStale,
    WatchdogWorkerHung,
    ConfigReloaded,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub forward_id: String,
    pub attributes: HashMap<String, String>,
}

impl Event {
    pub fn new(forward_id: impl Into<String>) -> Self {
        Event {
            forward_id: forward_id.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// A minimal in-process publish/subscribe bus: synchronous, per-topic FIFO dispatch,
/// best-effort, no buffering or replay. Subscription and close take the exclusive lock; publish
/// snapshots the handler list under a shared lock and invokes handlers without holding it, the
/// same read-then-release-then-invoke shape used by `HealthChecker` and `Watchdog`.
pub struct EventBus {
    handlers: RwLock<HashMap<Topic, Vec<Handler>>>,
    closed: RwLock<bool>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            handlers: RwLock::new(HashMap::new()),
            closed: RwLock::new(false),
        }
    }

    pub fn subscribe(&self, topic: Topic, handler: Handler) {
        self.handlers.write().unwrap().entry(topic).or_default().push(handler);
    }

    pub fn publish(&self, topic: Topic, event: Event) {
        if *self.closed.read().unwrap() {
            return;
        }
        let handlers = {
            let guard = self.handlers.read().unwrap();
            guard.get(&topic).cloned().unwrap_or_default()
        };
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn close(&self) {
        *self.closed.write().unwrap() = true;
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn dispatches_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        bus.subscribe(Topic::ForwardConnected, Arc::new(move |_e| o1.lock().unwrap().push(1)));
        let o2 = Arc::clone(&order);
        bus.subscribe(Topic::ForwardConnected, Arc::new(move |_e| o2.lock().unwrap().push(2)));

        bus.publish(Topic::ForwardConnected, Event::new("a"));

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn publish_after_close_is_noop() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        bus.subscribe(Topic::ConfigReloaded, Arc::new(move |_e| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        bus.close();
        bus.publish(Topic::ConfigReloaded, Event::new("a"));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unrelated_topic_does_not_fire() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        bus.subscribe(Topic::HealthStale, Arc::new(move |_e| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(Topic::HealthStatusChanged, Event::new("a"));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
