//! The driver contract.
//!
//! A driver is a named reconciler bound to a set of resource types. The
//! manager delivers every matching lifecycle event to its [`Reconciler`]
//! one at a time; reconcile should be idempotent because delivery is
//! at-least-once.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rekon_core::{EVENT_WILDCARD, event_filter_accepts};
use rekon_core::subject::resource_subject;
use serde_json::Value;

use crate::error::DriverError;
use crate::logger::DriverLogger;

/// Outcome of a single reconcile call.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverResult {
    pub success: bool,
    pub message: String,
    /// Optional driver-specific detail; not forwarded to the engine.
    pub data: Option<Value>,
}

impl DriverResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Brings the world in line with one resource change.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// `payload` is the serialized resource, `event` the lifecycle tag
    /// (`create`, `update`, `delete`), `run_id` the correlation id.
    async fn reconcile(
        &self,
        payload: &str,
        event: &str,
        run_id: &str,
        logger: &DriverLogger,
    ) -> DriverResult;
}

/// A driver registration. Not persisted.
#[derive(Clone)]
pub struct Driver {
    pub name: String,
    pub resources: Vec<String>,
    /// Event tags to reconcile; `*` matches every event.
    pub events: Vec<String>,
    pub reconciler: Arc<dyn Reconciler>,
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("name", &self.name)
            .field("resources", &self.resources)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// A driver that reconciles every event on `resources`.
    pub fn new<I, S>(name: &str, resources: I, reconciler: Arc<dyn Reconciler>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            resources: resources.into_iter().map(Into::into).collect(),
            events: vec![EVENT_WILDCARD.to_string()],
            reconciler,
        }
    }

    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = events.into_iter().map(Into::into).collect();
        self
    }

    /// Reject registrations that could never be bound.
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.name.trim().is_empty() {
            return Err(DriverError::Validation("driver name is required".into()));
        }
        if !is_token(&self.name) {
            return Err(DriverError::Validation(format!(
                "driver name '{}' must be a single subject token",
                self.name
            )));
        }
        if self.resources.is_empty() {
            return Err(DriverError::Validation(format!(
                "driver {} must reconcile at least one resource type",
                self.name
            )));
        }
        if let Some(bad) = self.resources.iter().find(|r| !is_token(r)) {
            return Err(DriverError::Validation(format!(
                "resource type '{bad}' must be a single subject token"
            )));
        }
        Ok(())
    }

    /// Does this driver reconcile `event`? An empty filter matches all.
    pub fn accepts(&self, event: &str) -> bool {
        event_filter_accepts(&self.events, event)
    }

    /// `resources.<type>` for every bound type.
    pub fn filter_subjects(&self) -> Vec<String> {
        self.resources.iter().map(|r| resource_subject(r)).collect()
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && !s
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
}
