//! Resource, definition, pipeline and run operations behind the HTTP API.
//!
//! Resource mutations follow one sequence: validate, persist, then
//! announce. The announcement is a `run.started` pipeline event followed
//! by a `DriverMessage` on `resources.<type>`, both carrying a fresh run
//! id. Store writes and publishes are not transactional: a failed publish
//! is logged and the call still succeeds.

use std::collections::HashSet;
use std::sync::Arc;

use axum::http::StatusCode;
use bytes::Bytes;
use rekon_bus::Publisher;
use rekon_core::schema::{self, SchemaError};
use rekon_core::subject::{RUN_STARTED_SUBJECT, resource_subject};
use rekon_core::{
    DriverMessage, EVENT_CREATE, EVENT_DELETE, EVENT_UPDATE, Pipeline, PipelineEvent, PipelineRun,
    Resource, ResourceDefinition, id,
};
use rekon_state::{StateError, StateStore};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StateError> for ServiceError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(key) => ServiceError::NotFound(key),
            StateError::AlreadyExists(key) => ServiceError::AlreadyExists(key),
            StateError::Unavailable(reason) => ServiceError::Unavailable(reason),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) | ServiceError::Schema(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::AlreadyExists(_) => StatusCode::CONFLICT,
            ServiceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// A persisted resource plus the run id of the reconciliation it started.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResourceChange {
    #[serde(flatten)]
    pub resource: Resource,
    pub run_id: String,
}

/// The operations exposed over HTTP.
#[derive(Clone)]
pub struct ResourceService {
    store: StateStore,
    publisher: Arc<dyn Publisher>,
}

impl ResourceService {
    pub fn new(store: StateStore, publisher: Arc<dyn Publisher>) -> Self {
        Self { store, publisher }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── Resource definitions ───────────────────────────────────────

    pub async fn create_resource_definition(
        &self,
        mut def: ResourceDefinition,
    ) -> ServiceResult<ResourceDefinition> {
        prepare_definition(&mut def)?;
        def.id = id::object_id();
        let stored = def.clone();
        self.store
            .call(move |s| s.insert_resource_definition(&stored))
            .await?;
        info!(definition = %def.name, "resource definition created");
        Ok(def)
    }

    pub async fn update_resource_definition(
        &self,
        name: &str,
        mut def: ResourceDefinition,
    ) -> ServiceResult<ResourceDefinition> {
        def.name = name.to_string();
        prepare_definition(&mut def)?;
        let def = self
            .store
            .call(move |s| {
                def.id = s.get_resource_definition(&def.name)?.id;
                s.update_resource_definition(&def)?;
                Ok(def)
            })
            .await?;
        info!(definition = %def.name, "resource definition updated");
        Ok(def)
    }

    /// Create-or-update. Returns the stored definition and whether it was
    /// newly created.
    pub async fn apply_resource_definition(
        &self,
        mut def: ResourceDefinition,
    ) -> ServiceResult<(ResourceDefinition, bool)> {
        prepare_definition(&mut def)?;
        let (def, created) = self
            .store
            .call(move |s| {
                def.id = match s.get_resource_definition(&def.name) {
                    Ok(existing) => existing.id,
                    Err(StateError::NotFound(_)) => id::object_id(),
                    Err(e) => return Err(e),
                };
                let created = s.apply_resource_definition(&def)?;
                Ok((def, created))
            })
            .await?;
        info!(definition = %def.name, created, "resource definition applied");
        Ok((def, created))
    }

    pub async fn get_resource_definition(&self, name: &str) -> ServiceResult<ResourceDefinition> {
        let name = name.to_string();
        Ok(self
            .store
            .call(move |s| s.get_resource_definition(&name))
            .await?)
    }

    pub async fn list_resource_definitions(&self) -> ServiceResult<Vec<ResourceDefinition>> {
        Ok(self.store.call(|s| s.list_resource_definitions()).await?)
    }

    pub async fn delete_resource_definition(&self, name: &str) -> ServiceResult<ResourceDefinition> {
        let name = name.to_string();
        let def = self
            .store
            .call(move |s| s.delete_resource_definition(&name))
            .await?;
        info!(definition = %def.name, "resource definition deleted");
        Ok(def)
    }

    // ── Resources ──────────────────────────────────────────────────

    /// Validate and store a new resource, then notify its drivers.
    pub async fn create_resource(&self, mut resource: Resource) -> ServiceResult<ResourceChange> {
        check_name("resource name", &resource.name)?;
        resource.id = id::object_id();
        let resource = self
            .store
            .call(move |s| Ok(insert_validated(s, resource)))
            .await??;
        info!(resource = %resource.resource, name = %resource.name, "resource created");
        let run_id = self.announce(&resource, EVENT_CREATE).await;
        Ok(ResourceChange { resource, run_id })
    }

    /// Replace a resource's spec. The stored id is kept.
    pub async fn update_resource(
        &self,
        resource_type: &str,
        name: &str,
        mut resource: Resource,
    ) -> ServiceResult<ResourceChange> {
        resource.resource = resource_type.to_string();
        resource.name = name.to_string();
        let resource = self
            .store
            .call(move |s| Ok(replace_validated(s, resource)))
            .await??;
        info!(resource = %resource.resource, name = %resource.name, "resource updated");
        let run_id = self.announce(&resource, EVENT_UPDATE).await;
        Ok(ResourceChange { resource, run_id })
    }

    pub async fn delete_resource(&self, resource_type: &str, name: &str) -> ServiceResult<ResourceChange> {
        let (resource_type, name) = (resource_type.to_string(), name.to_string());
        let resource = self
            .store
            .call(move |s| s.delete_resource(&resource_type, &name))
            .await?;
        info!(resource = %resource.resource, name = %resource.name, "resource deleted");
        let run_id = self.announce(&resource, EVENT_DELETE).await;
        Ok(ResourceChange { resource, run_id })
    }

    pub async fn get_resource(&self, resource_type: &str, name: &str) -> ServiceResult<Resource> {
        let (resource_type, name) = (resource_type.to_string(), name.to_string());
        Ok(self
            .store
            .call(move |s| s.get_resource(&resource_type, &name))
            .await?)
    }

    pub async fn list_resources(&self, resource_type: Option<String>) -> ServiceResult<Vec<Resource>> {
        Ok(self
            .store
            .call(move |s| s.list_resources(resource_type.as_deref()))
            .await?)
    }

    /// Publish `run.started` and the driver message for one mutation.
    /// Returns the run id; publish failures are logged only.
    async fn announce(&self, resource: &Resource, event: &str) -> String {
        let run_id = id::run_id();

        let started = PipelineEvent::run_started(&run_id, &resource.resource, &resource.name)
            .with_change(event);
        match started.to_bytes() {
            Ok(body) => self.publish(RUN_STARTED_SUBJECT, body, &run_id).await,
            Err(e) => warn!(%run_id, error = %e, "failed to encode run.started"),
        }

        let payload = match serde_json::to_string(resource) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%run_id, error = %e, "failed to encode resource payload");
                return run_id;
            }
        };
        let message = DriverMessage::new(event, payload, &run_id);
        match message.to_bytes() {
            Ok(body) => {
                self.publish(&resource_subject(&resource.resource), body, &run_id)
                    .await
            }
            Err(e) => warn!(%run_id, error = %e, "failed to encode driver message"),
        }
        debug!(%run_id, %event, resource = %resource.resource, name = %resource.name, "resource change announced");
        run_id
    }

    async fn publish(&self, subject: &str, body: Vec<u8>, run_id: &str) {
        if let Err(e) = self.publisher.publish(subject, Bytes::from(body)).await {
            warn!(%subject, %run_id, error = %e, "publish failed, change is stored but not dispatched");
        }
    }

    // ── Pipelines ──────────────────────────────────────────────────

    pub async fn create_pipeline(&self, mut pipeline: Pipeline) -> ServiceResult<Pipeline> {
        prepare_pipeline(&mut pipeline)?;
        let pipeline = self
            .store
            .call(move |s| {
                Ok(load_definition(s, &pipeline.resource)
                    .and_then(|_| s.insert_pipeline(&pipeline).map_err(ServiceError::from))
                    .map(|()| pipeline))
            })
            .await??;
        info!(pipeline = %pipeline.name, resource = %pipeline.resource, steps = pipeline.steps.len(), "pipeline created");
        Ok(pipeline)
    }

    pub async fn update_pipeline(&self, name: &str, mut pipeline: Pipeline) -> ServiceResult<Pipeline> {
        pipeline.name = name.to_string();
        prepare_pipeline(&mut pipeline)?;
        let pipeline = self
            .store
            .call(move |s| {
                Ok(load_definition(s, &pipeline.resource)
                    .and_then(|_| s.update_pipeline(&pipeline).map_err(ServiceError::from))
                    .map(|()| pipeline))
            })
            .await??;
        info!(pipeline = %pipeline.name, "pipeline updated");
        Ok(pipeline)
    }

    pub async fn get_pipeline(&self, name: &str) -> ServiceResult<Pipeline> {
        let name = name.to_string();
        Ok(self.store.call(move |s| s.get_pipeline(&name)).await?)
    }

    pub async fn list_pipelines(&self) -> ServiceResult<Vec<Pipeline>> {
        Ok(self.store.call(|s| s.list_pipelines()).await?)
    }

    pub async fn delete_pipeline(&self, name: &str) -> ServiceResult<Pipeline> {
        let name = name.to_string();
        let pipeline = self.store.call(move |s| s.delete_pipeline(&name)).await?;
        info!(pipeline = %pipeline.name, "pipeline deleted");
        Ok(pipeline)
    }

    // ── Runs ───────────────────────────────────────────────────────

    /// Every pipeline run recorded for `run_id`.
    pub async fn get_run(&self, run_id: &str) -> ServiceResult<Vec<PipelineRun>> {
        let key = run_id.to_string();
        let runs = self.store.call(move |s| s.list_runs(&key)).await?;
        if runs.is_empty() {
            return Err(ServiceError::NotFound(format!("run {run_id}")));
        }
        Ok(runs)
    }

    pub async fn list_runs(&self, run_id: Option<String>) -> ServiceResult<Vec<PipelineRun>> {
        Ok(self
            .store
            .call(move |s| match run_id {
                Some(run_id) => s.list_runs(&run_id),
                None => s.list_all_runs(),
            })
            .await?)
    }
}

fn insert_validated(store: &StateStore, resource: Resource) -> ServiceResult<Resource> {
    let def = load_definition(store, &resource.resource)?;
    schema::validate(&resource, &def)?;
    store.insert_resource(&resource)?;
    Ok(resource)
}

fn replace_validated(store: &StateStore, mut resource: Resource) -> ServiceResult<Resource> {
    let def = load_definition(store, &resource.resource)?;
    schema::validate(&resource, &def)?;
    resource.id = store.get_resource(&resource.resource, &resource.name)?.id;
    store.update_resource(&resource)?;
    Ok(resource)
}

/// Look up a resource's definition, reporting absence as a client error.
fn load_definition(store: &StateStore, name: &str) -> ServiceResult<ResourceDefinition> {
    match store.get_resource_definition(name) {
        Ok(def) => Ok(def),
        Err(StateError::NotFound(_)) => Err(ServiceError::Validation(format!(
            "resource definition '{name}' does not exist"
        ))),
        Err(e) => Err(e.into()),
    }
}

fn prepare_definition(def: &mut ResourceDefinition) -> ServiceResult<()> {
    check_token("resource definition name", &def.name)?;
    if def.schema.is_null() {
        def.schema = serde_json::json!({});
    }
    schema::compile(def)?;
    Ok(())
}

fn prepare_pipeline(pipeline: &mut Pipeline) -> ServiceResult<()> {
    check_token("pipeline name", &pipeline.name)?;
    check_token("pipeline resource", &pipeline.resource)?;
    let mut drivers = HashSet::new();
    for step in pipeline.steps.iter_mut() {
        if step.driver.trim().is_empty() {
            return Err(ServiceError::Validation(format!(
                "step '{}' has no driver",
                step.name
            )));
        }
        if !drivers.insert(step.driver.clone()) {
            return Err(ServiceError::Validation(format!(
                "driver '{}' appears in more than one step",
                step.driver
            )));
        }
        if step.id.is_empty() {
            step.id = id::object_id();
        }
        if step.name.is_empty() {
            step.name = step.driver.clone();
        }
    }
    Ok(())
}

/// Names that become part of a store key.
fn check_name(what: &str, value: &str) -> ServiceResult<()> {
    if value.trim().is_empty() {
        return Err(ServiceError::Validation(format!("{what} is required")));
    }
    if value.contains('/') {
        return Err(ServiceError::Validation(format!(
            "{what} '{value}' must not contain '/'"
        )));
    }
    Ok(())
}

/// Names that also become a bus subject token.
fn check_token(what: &str, value: &str) -> ServiceResult<()> {
    check_name(what, value)?;
    if value
        .chars()
        .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
    {
        return Err(ServiceError::Validation(format!(
            "{what} '{value}' must not contain '.', '*', '>' or whitespace"
        )));
    }
    Ok(())
}
