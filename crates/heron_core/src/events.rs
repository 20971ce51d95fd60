//! Config-Change Events and Observer Fan-Out
//!
//! Endpoint threads queue events while holding their own lock and hand
//! them to the dispatcher only after releasing it; the dispatcher then
//! walks the observer list under its own lock. That keeps the lock
//! ranks straight: an observer callback can call back into the server
//! without ever nesting inside a thread lock.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::types::{EndpointDescriptor, IoHandle, StreamType};

/// Events delivered to registered clients when the endpoint topology or
/// configuration changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum IoConfigEvent {
    OutputOpened {
        handle: IoHandle,
        descriptor: EndpointDescriptor,
    },
    OutputClosed {
        handle: IoHandle,
    },
    OutputConfigChanged {
        handle: IoHandle,
        descriptor: EndpointDescriptor,
    },
    /// All tracks of `stream` now play on `handle`. Delivered as a
    /// stream event only; it never implies a close.
    StreamConfigChanged {
        handle: IoHandle,
        stream: StreamType,
    },
    InputOpened {
        handle: IoHandle,
        descriptor: EndpointDescriptor,
    },
    InputClosed {
        handle: IoHandle,
    },
    InputConfigChanged {
        handle: IoHandle,
        descriptor: EndpointDescriptor,
    },
}

/// Client-side observer of endpoint configuration changes.
pub trait ConfigObserver: Send + Sync {
    fn io_config_changed(&self, event: &IoConfigEvent);
}

/// The server's observer registry. Events from one thread arrive in
/// FIFO order; ordering across threads is unspecified.
#[derive(Default)]
pub struct EventDispatcher {
    observers: Mutex<Vec<Arc<dyn ConfigObserver>>>,
}

impl EventDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, observer: Arc<dyn ConfigObserver>) {
        self.observers.lock().push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Deliver one event to every observer. Callers must not hold any
    /// thread lock.
    pub fn dispatch(&self, event: &IoConfigEvent) {
        trace!("dispatching {:?}", event);
        let observers = self.observers.lock();
        for observer in observers.iter() {
            observer.io_config_changed(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl ConfigObserver for Counter {
        fn io_config_changed(&self, _event: &IoConfigEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_dispatch_reaches_all_observers() {
        let dispatcher = EventDispatcher::new();
        let a = Arc::new(Counter(AtomicUsize::new(0)));
        let b = Arc::new(Counter(AtomicUsize::new(0)));
        dispatcher.register(a.clone());
        dispatcher.register(b.clone());

        dispatcher.dispatch(&IoConfigEvent::OutputClosed { handle: 3 });
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_serialization() {
        let event = IoConfigEvent::StreamConfigChanged {
            handle: 2,
            stream: StreamType::Music,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("StreamConfigChanged"));

        let back: IoConfigEvent = serde_json::from_str(&json).unwrap();
        match back {
            IoConfigEvent::StreamConfigChanged { handle, stream } => {
                assert_eq!(handle, 2);
                assert_eq!(stream, StreamType::Music);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }
}
