//! Synchronous event bus: fan-out of [`Event`]s to registered listeners.
//!
//! Posting happens on the caller's thread; listeners must return quickly and
//! must not block on the bus. A listener may remove itself (or others) from
//! inside a callback: the listener list is snapshotted before dispatch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::events::Event;

/// Trait for receiving bus events. The session machine and the host
/// application both implement this.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Handle returned by [`EventBus::add_listener`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn EventListener>)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .retain(|(lid, _)| *lid != id);
    }

    /// Synchronous fan-out on the posting thread.
    pub fn post(&self, event: Event) {
        tracing::debug!(event = event.name(), "bus.post");
        let snapshot: Vec<Arc<dyn EventListener>> = self
            .listeners
            .lock()
            .expect("listener registry poisoned")
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener.on_event(&event);
        }
    }
}

/// No-op listener for modules that only need a subscription slot.
pub struct NoOpListener;

impl EventListener for NoOpListener {
    fn on_event(&self, _event: &Event) {}
}

/// In-memory listener that captures events for testing.
#[derive(Default)]
pub struct CaptureListener {
    events: Mutex<Vec<Event>>,
}

impl CaptureListener {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("capture listener poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("capture listener poisoned").len()
    }

    pub fn count_name(&self, name: &str) -> usize {
        self.events
            .lock()
            .expect("capture listener poisoned")
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("capture listener poisoned").clear();
    }
}

impl EventListener for CaptureListener {
    fn on_event(&self, event: &Event) {
        self.events
            .lock()
            .expect("capture listener poisoned")
            .push(event.clone());
    }
}

/// Convenience: capture listener for tests.
pub fn capture_listener() -> Arc<CaptureListener> {
    Arc::new(CaptureListener::new())
}
