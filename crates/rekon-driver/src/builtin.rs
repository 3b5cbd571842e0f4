//! Drivers that ship with the daemon.

use std::sync::Arc;

use async_trait::async_trait;
use rekon_core::Resource;
use rekon_core::config::DriverConfig;

use crate::driver::{Driver, DriverResult, Reconciler};
use crate::error::DriverError;
use crate::logger::DriverLogger;

pub const KIND_EVENT_LOG: &str = "event-log";

/// Records every lifecycle event it receives in the driver log and
/// succeeds. Useful as an audit trail and for wiring checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventLogDriver;

#[async_trait]
impl Reconciler for EventLogDriver {
    async fn reconcile(
        &self,
        payload: &str,
        event: &str,
        _run_id: &str,
        logger: &DriverLogger,
    ) -> DriverResult {
        let resource: Resource = match serde_json::from_str(payload) {
            Ok(resource) => resource,
            Err(e) => return DriverResult::failed(format!("payload is not a resource: {e}")),
        };

        let labels = [
            ("resource", resource.resource.as_str()),
            ("name", resource.name.as_str()),
        ];
        // A lost log line is not a reconcile failure.
        if let Err(e) = logger.log(&labels, &format!("{event} {}/{}", resource.resource, resource.name)).await {
            tracing::warn!(error = %e, "event-log driver could not write log line");
        }

        DriverResult::ok(format!("recorded {event} of {}/{}", resource.resource, resource.name))
            .with_data(serde_json::json!({ "id": resource.id }))
    }
}

/// Build a driver registration from its config entry.
pub fn from_config(config: &DriverConfig) -> Result<Driver, DriverError> {
    let reconciler: Arc<dyn Reconciler> = match config.kind.as_str() {
        KIND_EVENT_LOG => Arc::new(EventLogDriver),
        other => {
            return Err(DriverError::UnknownKind {
                name: config.name.clone(),
                kind: other.to_string(),
            });
        }
    };
    let driver = Driver::new(&config.name, config.resources.iter().cloned(), reconciler)
        .with_events(config.events.iter().cloned());
    driver.validate()?;
    Ok(driver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::MemorySink;
    use serde_json::json;

    #[tokio::test]
    async fn event_log_records_the_resource() {
        let sink = MemorySink::new();
        let logger = DriverLogger::new(Arc::new(sink.clone()), "audit", "run-1", "create");
        let payload = json!({"id": "r1", "name": "p1", "resource": "pipe", "spec": {}}).to_string();

        let result = EventLogDriver.reconcile(&payload, "create", "run-1", &logger).await;

        assert!(result.success);
        assert_eq!(result.data, Some(json!({"id": "r1"})));
        let lines = sink.lines();
        assert_eq!(lines[0].message, "create pipe/p1");
        assert_eq!(lines[0].labels["name"], "p1");
        assert_eq!(lines[0].labels["driver"], "audit");
    }

    #[tokio::test]
    async fn event_log_fails_on_garbage() {
        let logger = DriverLogger::new(Arc::new(MemorySink::new()), "audit", "run-1", "create");
        let result = EventLogDriver.reconcile("nope", "create", "run-1", &logger).await;
        assert!(!result.success);
    }

    #[test]
    fn from_config_builds_known_kinds() {
        let config = DriverConfig {
            name: "audit".to_string(),
            kind: KIND_EVENT_LOG.to_string(),
            resources: vec!["pipe".to_string()],
            events: vec!["create".to_string()],
        };
        let driver = from_config(&config).unwrap();
        assert_eq!(driver.name, "audit");
        assert!(driver.accepts("create"));
        assert!(!driver.accepts("delete"));

        let unknown = DriverConfig {
            kind: "docker".to_string(),
            ..config
        };
        assert!(matches!(
            from_config(&unknown),
            Err(DriverError::UnknownKind { .. })
        ));
    }
}
