//! Observer interface for request and circuit events.
//!
//! The orchestration core never renders anything; UI and telemetry consumers
//! subscribe by implementing [`Observer`] and registering it on the builder.

use crate::types::Priority;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Event emitted by the orchestration core
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestrationEvent {
    RequestStarted {
        request_id: String,
        function_id: String,
        priority: Priority,
        streaming: bool,
    },
    RequestRetrying {
        request_id: String,
        provider: String,
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    RequestCompleted {
        request_id: String,
        provider: Option<String>,
        latency: Duration,
        cached: bool,
    },
    RequestFailed {
        request_id: String,
        provider: Option<String>,
        error: String,
    },
    RequestCancelled {
        request_id: String,
    },
    CircuitOpened {
        provider: String,
        cooldown: Duration,
    },
    CircuitHalfOpened {
        provider: String,
    },
    CircuitClosed {
        provider: String,
    },
}

impl OrchestrationEvent {
    /// Short event name, stable across versions
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestStarted { .. } => "requestStarted",
            Self::RequestRetrying { .. } => "requestRetrying",
            Self::RequestCompleted { .. } => "requestCompleted",
            Self::RequestFailed { .. } => "requestFailed",
            Self::RequestCancelled { .. } => "requestCancelled",
            Self::CircuitOpened { .. } => "circuitOpened",
            Self::CircuitHalfOpened { .. } => "circuitHalfOpened",
            Self::CircuitClosed { .. } => "circuitClosed",
        }
    }
}

/// Receiver of orchestration events.
///
/// Called inline on the emitting task, possibly from drop paths, so
/// implementations must be quick and must not block.
pub trait Observer: Send + Sync + Debug + 'static {
    /// Observer name
    fn name(&self) -> &str;

    fn on_event(&self, event: &OrchestrationEvent);
}

/// Fan-out to every registered observer.
#[derive(Debug, Clone, Default)]
pub struct ObserverHub {
    observers: Vec<Arc<dyn Observer>>,
}

impl ObserverHub {
    pub fn new(observers: Vec<Arc<dyn Observer>>) -> Self {
        Self { observers }
    }

    /// Get all observers
    pub fn observers(&self) -> &[Arc<dyn Observer>] {
        &self.observers
    }

    pub fn emit(&self, event: OrchestrationEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }
}

/// Observer that keeps every event in memory
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingObserver {
    events: std::sync::Mutex<Vec<OrchestrationEvent>>,
}

#[cfg(test)]
impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events
    pub fn events(&self) -> Vec<OrchestrationEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Names of the recorded events, in emission order
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.name()).collect()
    }
}

#[cfg(test)]
impl Observer for RecordingObserver {
    fn name(&self) -> &str {
        "recording"
    }

    fn on_event(&self, event: &OrchestrationEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_fans_out() {
        let a = Arc::new(RecordingObserver::new());
        let b = Arc::new(RecordingObserver::new());
        let hub = ObserverHub::new(vec![a.clone(), b.clone()]);

        hub.emit(OrchestrationEvent::CircuitClosed {
            provider: "openai".into(),
        });

        assert_eq!(a.names(), vec!["circuitClosed"]);
        assert_eq!(b.events().len(), 1);
        assert_eq!(hub.observers().len(), 2);
    }
}
