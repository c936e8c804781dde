use std::sync::{Arc, Mutex};

use serde_json::Value;

/// Sink invoked on every workflow/task/volunteer state change. The actual
/// delivery transport (websocket fan-out in the full deployment) sits behind
/// this trait and is out of the engine's scope.
pub trait NotificationSink: Send + Sync + std::fmt::Debug {
    fn notify(&self, event_type: &str, data: Value);
}

/// Default sink: state changes go to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, event_type: &str, data: Value) {
        log::info!("Notification '{}': {}", event_type, data);
    }
}

/// Test sink recording every event.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<(String, Value)>>,
}

impl MemoryNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        self.events.lock().expect("Mutex poisoned").clone()
    }

    pub fn count_of(&self, event_type: &str) -> usize {
        self.events().iter().filter(|(kind, _)| kind == event_type).count()
    }
}

impl NotificationSink for MemoryNotifier {
    fn notify(&self, event_type: &str, data: Value) {
        self.events.lock().expect("Mutex poisoned").push((event_type.to_string(), data));
    }
}
