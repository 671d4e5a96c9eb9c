use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use serde_json::Value;

pub type ListenerResult = Result<(), String>;

type Listener = Arc<dyn Fn(&Event) -> ListenerResult + Send + Sync>;

/// Lifecycle notifications published by the worker.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum WorkerEvent {
    /// Fetch loop, heartbeat or ACK/FAIL reporting failed.
    Error,
    /// A job failed and was reported with `FAIL`.
    Fail,
    Quiet,
    Stop,
}

impl WorkerEvent {
    pub const ALL: [Self; 4] = [Self::Error, Self::Fail, Self::Quiet, Self::Stop];

    pub fn name(self) -> &'static str {
        match self {
            Self::Error => "worker.error",
            Self::Fail => "worker.fail",
            Self::Quiet => "worker.quiet",
            Self::Stop => "worker.stop",
        }
    }
}

impl fmt::Display for WorkerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub name: String,
    pub payload: Option<Value>,
}

#[derive(Debug)]
pub enum EmitError {
    ListenerFailed {
        event: String,
        listener_index: usize,
        message: String,
    },
    ListenerPanicked {
        event: String,
        listener_index: usize,
    },
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListenerFailed {
                event,
                listener_index,
                message,
            } => write!(
                f,
                "listener #{listener_index} failed for event '{event}': {message}"
            ),
            Self::ListenerPanicked {
                event,
                listener_index,
            } => write!(f, "listener #{listener_index} panicked for event '{event}'"),
        }
    }
}

impl Error for EmitError {}

/// Named-event fan-out. Listeners run synchronously on the emitting thread in
/// registration order; the first failure stops delivery and is returned.
#[derive(Default)]
pub struct EventEmitter {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, event_name: impl Into<String>, listener: F)
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .expect("event listener map lock poisoned")
            .entry(event_name.into())
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn on_worker<F>(&self, event: WorkerEvent, listener: F)
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        self.on(event.name(), listener);
    }

    pub fn listener_count(&self, event_name: &str) -> usize {
        self.listeners
            .read()
            .expect("event listener map lock poisoned")
            .get(event_name)
            .map_or(0, Vec::len)
    }

    pub fn emit(
        &self,
        event_name: impl Into<String>,
        payload: Option<Value>,
    ) -> Result<(), EmitError> {
        let event = Event {
            name: event_name.into(),
            payload,
        };

        // Listeners may register further listeners; run them without the lock.
        let handlers = self
            .listeners
            .read()
            .expect("event listener map lock poisoned")
            .get(&event.name)
            .cloned()
            .unwrap_or_default();

        for (listener_index, handler) in handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    return Err(EmitError::ListenerFailed {
                        event: event.name.clone(),
                        listener_index,
                        message,
                    });
                }
                Err(_) => {
                    return Err(EmitError::ListenerPanicked {
                        event: event.name.clone(),
                        listener_index,
                    });
                }
            }
        }

        Ok(())
    }

    pub fn emit_worker(&self, event: WorkerEvent, payload: Value) -> Result<(), EmitError> {
        self.emit(event.name(), Some(payload))
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self
            .listeners
            .read()
            .map(|listeners| listeners.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        f.debug_struct("EventEmitter").field("events", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::{EmitError, EventEmitter, WorkerEvent};

    #[test]
    fn listener_receives_worker_event_payload() {
        let emitter = EventEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        emitter.on_worker(WorkerEvent::Fail, move |event| {
            if event.payload == Some(json!({"jid":"abc"})) {
                calls_clone.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        });

        emitter
            .emit_worker(WorkerEvent::Fail, json!({"jid":"abc"}))
            .expect("emit should succeed");
        emitter
            .emit_worker(WorkerEvent::Error, json!({"jid":"abc"}))
            .expect("emit without listeners is a no-op");

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(emitter.listener_count("worker.fail"), 1);
        assert_eq!(emitter.listener_count("worker.error"), 0);
    }

    #[test]
    fn listener_error_bubbles_up() {
        let emitter = EventEmitter::new();
        emitter.on("worker.stop", |_event| Err("listener failure".to_owned()));

        let result = emitter.emit("worker.stop", None);
        assert!(matches!(
            result,
            Err(EmitError::ListenerFailed {
                listener_index: 0,
                ..
            })
        ));
    }

    #[test]
    fn listener_panic_is_recovered_and_returned() {
        let emitter = EventEmitter::new();
        emitter.on("worker.quiet", |_event| Ok(()));
        emitter.on("worker.quiet", |_event| panic!("boom"));

        let result = emitter.emit("worker.quiet", None);
        assert!(matches!(
            result,
            Err(EmitError::ListenerPanicked {
                listener_index: 1,
                ..
            })
        ));
    }

    #[test]
    fn listener_may_subscribe_during_emit() {
        let emitter = Arc::new(EventEmitter::new());
        let inner = Arc::clone(&emitter);
        emitter.on("worker.error", move |_event| {
            inner.on("worker.error", |_event| Ok(()));
            Ok(())
        });

        emitter.emit("worker.error", None).expect("emit should succeed");
        assert_eq!(emitter.listener_count("worker.error"), 2);
    }

    #[test]
    fn event_names_are_namespaced() {
        let names = WorkerEvent::ALL.map(WorkerEvent::name);
        assert_eq!(names, ["worker.error", "worker.fail", "worker.quiet", "worker.stop"]);
    }
}
