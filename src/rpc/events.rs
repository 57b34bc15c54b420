//! Observer list for connection events and unsolicited router messages.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tracing::error;

/// Event name used for subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Error,
    Message,
    MaxReconnectAttemptsReached,
}

impl EventKind {
    /// Wire-style event name, as used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::Error => "error",
            EventKind::Message => "message",
            EventKind::MaxReconnectAttemptsReached => "maxReconnectAttemptsReached",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The socket for `target` opened.
    Connected { target: String },
    /// The socket closed. `code` is the WebSocket close code (1006 when the
    /// connection dropped without a close frame or was forced closed).
    Disconnected { code: u16, reason: String },
    /// A connection attempt failed, or the open socket hit a transport
    /// error. A transport error is followed by `Disconnected`.
    Error { message: String },
    /// An inbound frame that did not answer any outstanding request.
    Message(Value),
    /// Automatic reconnection gave up after `attempts` tries.
    MaxReconnectAttemptsReached { attempts: u32 },
}

impl ClientEvent {
    /// The subscription kind this event is delivered to.
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::Connected { .. } => EventKind::Connected,
            ClientEvent::Disconnected { .. } => EventKind::Disconnected,
            ClientEvent::Error { .. } => EventKind::Error,
            ClientEvent::Message(_) => EventKind::Message,
            ClientEvent::MaxReconnectAttemptsReached { .. } => {
                EventKind::MaxReconnectAttemptsReached
            }
        }
    }
}

type Callback = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

struct Listener {
    id: u64,
    kind: EventKind,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Listener>>,
}

impl Registry {
    fn listeners(&self) -> MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Event bus. Cloning yields another handle to the same listener list.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.registry.listeners().len())
            .finish()
    }
}

impl EventBus {
    /// Create a bus with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for events of `kind`.
    ///
    /// Callbacks for the same kind run in registration order. The returned
    /// handle removes exactly this registration.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.listeners().push(Listener {
            id,
            kind,
            callback: Arc::new(callback),
        });

        Subscription {
            id,
            kind,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Invoke every callback registered for the event's kind.
    ///
    /// A panicking callback is logged and skipped; the remaining callbacks
    /// still run. Callbacks may subscribe or unsubscribe while running.
    pub fn emit(&self, event: &ClientEvent) {
        let kind = event.kind();
        let callbacks: Vec<Callback> = self
            .registry
            .listeners()
            .iter()
            .filter(|l| l.kind == kind)
            .map(|l| l.callback.clone())
            .collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!("Listener for '{}' event panicked", kind);
            }
        }
    }
}

/// Handle returned by [`EventBus::on`].
///
/// Dropping the handle keeps the callback registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    kind: EventKind,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Event kind this subscription listens for.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Remove this registration. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut listeners = registry.listeners();
        match listeners.iter().position(|l| l.id == self.id) {
            Some(index) => {
                listeners.remove(index);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    type Recorder = Box<dyn Fn(&ClientEvent) + Send + Sync>;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Recorder) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |name: &str| {
            let log = log_clone.clone();
            let name = name.to_string();
            Box::new(move |_: &ClientEvent| log.lock().unwrap().push(name.clone())) as Recorder
        };
        (log, make)
    }

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();

        let _a = bus.on(EventKind::Connected, make("a"));
        let _b = bus.on(EventKind::Connected, make("b"));
        let _c = bus.on(EventKind::Disconnected, make("c"));

        bus.emit(&ClientEvent::Connected { target: "r1".into() });
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_unsubscribe_removes_exactly_one_registration() {
        let bus = EventBus::new();
        let (log, make) = recorder();

        let first = bus.on(EventKind::Message, make("x"));
        let _second = bus.on(EventKind::Message, make("x"));

        assert!(first.unsubscribe());

        bus.emit(&ClientEvent::Message(serde_json::json!({"event": "tick"})));
        assert_eq!(*log.lock().unwrap(), vec!["x"]);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let bus = EventBus::new();
        let (log, make) = recorder();

        let _boom = bus.on(EventKind::Error, |_| panic!("listener bug"));
        let _ok = bus.on(EventKind::Error, make("after"));

        bus.emit(&ClientEvent::Error {
            message: "refused".into(),
        });
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[test]
    fn test_unsubscribe_after_bus_dropped() {
        let bus = EventBus::new();
        let sub = bus.on(EventKind::Connected, |_| {});
        drop(bus);
        assert!(!sub.unsubscribe());
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(
            ClientEvent::MaxReconnectAttemptsReached { attempts: 5 }.kind().to_string(),
            "maxReconnectAttemptsReached"
        );
        assert_eq!(EventKind::Message.as_str(), "message");
    }
}
