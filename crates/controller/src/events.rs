//! Event recording.
//!
//! Events are fire-and-forget annotations on an object: a recorder never
//! fails its caller and never blocks a reconciliation pass.

use parking_lot::Mutex;
use std::fmt;
use tracing::{info, warn};

use warden_common::ObjectKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => f.write_str("Normal"),
            EventType::Warning => f.write_str("Warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub object: ObjectKey,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

pub trait EventRecorder: Send + Sync {
    fn record(&self, object: &ObjectKey, event_type: EventType, reason: &str, message: &str);

    fn normal(&self, object: &ObjectKey, reason: &str, message: &str) {
        self.record(object, EventType::Normal, reason, message);
    }

    fn warning(&self, object: &ObjectKey, reason: &str, message: &str) {
        self.record(object, EventType::Warning, reason, message);
    }
}

/// Emits events as log lines.
#[derive(Debug, Default)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn record(&self, object: &ObjectKey, event_type: EventType, reason: &str, message: &str) {
        match event_type {
            EventType::Normal => info!(object = %object, reason = reason, "{}", message),
            EventType::Warning => warn!(object = %object, reason = reason, "{}", message),
        }
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<Event>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Events with the given reason.
    pub fn with_reason(&self, reason: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.reason == reason)
            .cloned()
            .collect()
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, object: &ObjectKey, event_type: EventType, reason: &str, message: &str) {
        self.events.lock().push(Event {
            object: object.clone(),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_recorder_filters_by_reason() {
        let recorder = MemoryRecorder::new();
        let issuer = ObjectKey::new("Issuer", "default", "le");
        recorder.warning(&issuer, "ErrInitIssuer", "Error initializing issuer: boom");
        recorder.normal(&issuer, "KeyPairVerified", "Signing CA verified");

        assert_eq!(recorder.events().len(), 2);
        let warnings = recorder.with_reason("ErrInitIssuer");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].event_type, EventType::Warning);
    }
}
