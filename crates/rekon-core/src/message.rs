//! Bus wire envelopes.
//!
//! `DriverMessage` travels on `resources.<type>` from the service to the
//! drivers; `PipelineEvent` travels on `pipelines.*` from drivers and the
//! service to the engine, and on `events.runs.<pipeline>` from the engine.

use serde::{Deserialize, Serialize};

use crate::id;

/// Lifecycle action tags carried in [`DriverMessage::event`].
pub const EVENT_CREATE: &str = "create";
pub const EVENT_UPDATE: &str = "update";
pub const EVENT_DELETE: &str = "delete";

/// Event filter entry that matches every event.
pub const EVENT_WILDCARD: &str = "*";

/// Pipeline event tags carried in [`PipelineEvent::event`].
pub const PIPELINE_DRIVER_RESULT: &str = "driver.result";
pub const PIPELINE_RUN_STARTED: &str = "run.started";
pub const PIPELINE_RUN_COMPLETED: &str = "run.completed";
pub const PIPELINE_RUN_FAILED: &str = "run.failed";

/// Does an event filter list accept `event`? An empty list, or one holding
/// [`EVENT_WILDCARD`], accepts everything.
pub fn event_filter_accepts<S: AsRef<str>>(filter: &[S], event: &str) -> bool {
    filter.is_empty()
        || filter
            .iter()
            .any(|e| e.as_ref() == EVENT_WILDCARD || e.as_ref() == event)
}

/// Envelope delivered to drivers for every resource change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverMessage {
    /// Random 24-hex-char token.
    pub id: String,
    pub event: String,
    /// Serialized resource, opaque to the bus.
    pub payload: String,
    pub run_id: String,
}

impl DriverMessage {
    /// Build a message with a fresh message id.
    pub fn new(event: &str, payload: String, run_id: &str) -> Self {
        Self {
            id: id::message_id(),
            event: event.to_string(),
            payload,
            run_id: run_id.to_string(),
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Outcome of one reconcile call, as reported by a driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverResultEvent {
    pub success: bool,
    pub message: String,
    pub driver: String,
    pub run_id: String,
    pub resource: String,
}

/// Envelope on the pipeline-engine stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineEvent {
    pub event: String,
    pub run_id: String,
    /// Resource type the event concerns.
    pub resource: String,
    /// Name of the resource instance, when known.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Resource lifecycle event behind a `run.started` (`create`, ...).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub change: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<DriverResultEvent>,
}

impl PipelineEvent {
    /// Wrap a driver outcome for the engine.
    pub fn driver_result(result: DriverResultEvent) -> Self {
        Self {
            event: PIPELINE_DRIVER_RESULT.to_string(),
            run_id: result.run_id.clone(),
            resource: result.resource.clone(),
            name: String::new(),
            change: String::new(),
            result: Some(result),
        }
    }

    pub fn run_started(run_id: &str, resource_type: &str, name: &str) -> Self {
        Self {
            event: PIPELINE_RUN_STARTED.to_string(),
            run_id: run_id.to_string(),
            resource: resource_type.to_string(),
            name: name.to_string(),
            change: String::new(),
            result: None,
        }
    }

    /// Record which resource event started the run.
    pub fn with_change(mut self, event: &str) -> Self {
        self.change = event.to_string();
        self
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_message_gets_fresh_id() {
        let a = DriverMessage::new(EVENT_CREATE, "{}".to_string(), "run-1");
        let b = DriverMessage::new(EVENT_CREATE, "{}".to_string(), "run-1");
        assert_eq!(a.id.len(), 24);
        assert_ne!(a.id, b.id);
        assert_eq!(a.run_id, "run-1");
    }

    #[test]
    fn driver_result_event_wraps_run_and_resource() {
        let event = PipelineEvent::driver_result(DriverResultEvent {
            success: true,
            message: "ok".to_string(),
            driver: "docker".to_string(),
            run_id: "run-9".to_string(),
            resource: "app".to_string(),
        });
        assert_eq!(event.event, PIPELINE_DRIVER_RESULT);
        assert_eq!(event.run_id, "run-9");
        assert_eq!(event.resource, "app");

        let json = String::from_utf8(event.to_bytes().unwrap()).unwrap();
        assert!(!json.contains("\"name\""));
        assert_eq!(PipelineEvent::from_bytes(json.as_bytes()).unwrap(), event);
    }

    #[test]
    fn run_started_carries_the_change_when_set() {
        let plain = PipelineEvent::run_started("run-1", "app", "web");
        let json = String::from_utf8(plain.to_bytes().unwrap()).unwrap();
        assert!(!json.contains("\"change\""));

        let update = plain.with_change(EVENT_UPDATE);
        let decoded = PipelineEvent::from_bytes(&update.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.change, "update");
    }

    #[test]
    fn event_filters() {
        let none: [&str; 0] = [];
        assert!(event_filter_accepts(&none, EVENT_DELETE));
        assert!(event_filter_accepts(&[EVENT_WILDCARD], EVENT_DELETE));
        assert!(event_filter_accepts(&["create", "update"], EVENT_UPDATE));
        assert!(!event_filter_accepts(&["create"], EVENT_DELETE));
    }

    #[test]
    fn malformed_envelope_is_rejected() {
        assert!(DriverMessage::from_bytes(b"{\"id\": 3}").is_err());
        assert!(DriverMessage::from_bytes(b"not json").is_err());
    }
}
