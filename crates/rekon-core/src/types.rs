//! Persisted domain types for the rekon control plane.
//!
//! Resource definitions, resources, pipelines and pipeline runs are stored
//! as JSON under hierarchical keys (see [`ResourceDefinition::table_key`]
//! and friends). Free-form fields (`schema`, `spec`) are carried as
//! [`serde_json::Value`] and validated at runtime.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Key prefix for resource definitions.
pub const RESOURCE_DEFINITIONS_PREFIX: &str = "/resource_definitions/";

/// Key prefix for resources.
pub const RESOURCES_PREFIX: &str = "/resources/";

/// Key prefix for pipelines.
pub const PIPELINES_PREFIX: &str = "/pipelines/";

/// Key prefix for pipeline runs.
pub const RUNS_PREFIX: &str = "/runs/";

// ── Resource definition ────────────────────────────────────────────

/// Schema and metadata describing a resource type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDefinition {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    /// JSON-Schema document applied to every resource of this type.
    #[serde(default)]
    pub schema: Value,
}

impl ResourceDefinition {
    /// Build the store key for this definition.
    pub fn table_key(&self) -> String {
        Self::key_for(&self.name)
    }

    pub fn key_for(name: &str) -> String {
        format!("{RESOURCE_DEFINITIONS_PREFIX}{name}")
    }
}

// ── Resource ───────────────────────────────────────────────────────

/// A named instance of a user-defined resource type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// Name of the [`ResourceDefinition`] this resource conforms to.
    pub resource: String,
    #[serde(default)]
    pub spec: Value,
}

impl Resource {
    /// Build the store key for this resource (`/resources/{type}/{name}`).
    pub fn table_key(&self) -> String {
        Self::key_for(&self.resource, &self.name)
    }

    pub fn key_for(resource_type: &str, name: &str) -> String {
        format!("{RESOURCES_PREFIX}{resource_type}/{name}")
    }

    /// Prefix covering every resource of one type.
    pub fn type_prefix(resource_type: &str) -> String {
        format!("{RESOURCES_PREFIX}{resource_type}/")
    }
}

// ── Pipeline ───────────────────────────────────────────────────────

/// One step of a pipeline, bound to the driver expected to process it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineStep {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub driver: String,
}

/// The ordered set of drivers expected to process a resource type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pipeline {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    /// Resource type this pipeline reacts to.
    pub resource: String,
    #[serde(default)]
    pub steps: Vec<PipelineStep>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Pipeline {
    /// Build the store key for this pipeline.
    pub fn table_key(&self) -> String {
        Self::key_for(&self.name)
    }

    pub fn key_for(name: &str) -> String {
        format!("{PIPELINES_PREFIX}{name}")
    }

    /// Find the step handled by `driver`.
    pub fn step_for_driver(&self, driver: &str) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.driver == driver)
    }
}

// ── Pipeline run ───────────────────────────────────────────────────

/// Overall state of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// State of a single step inside a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

/// Step progress recorded for a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepState {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Correlated progress of one pipeline for one run id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineRun {
    pub run_id: String,
    pub pipeline: String,
    pub resource_type: String,
    #[serde(default)]
    pub resource_name: String,
    pub status: RunStatus,
    pub steps: Vec<StepState>,
    /// Unix timestamp (seconds) when the run was opened.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last state change.
    pub updated_at: u64,
}

impl PipelineRun {
    /// Open a run with every step of `pipeline` pending.
    pub fn open(run_id: &str, pipeline: &Pipeline, resource_name: &str, now: u64) -> Self {
        Self {
            run_id: run_id.to_string(),
            pipeline: pipeline.name.clone(),
            resource_type: pipeline.resource.clone(),
            resource_name: resource_name.to_string(),
            status: RunStatus::Running,
            steps: pipeline
                .steps
                .iter()
                .map(|s| StepState {
                    id: s.id.clone(),
                    name: s.name.clone(),
                    driver: s.driver.clone(),
                    status: StepStatus::Pending,
                    message: String::new(),
                })
                .collect(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn table_key(&self) -> String {
        Self::key_for(&self.run_id, &self.pipeline)
    }

    pub fn key_for(run_id: &str, pipeline: &str) -> String {
        format!("{RUNS_PREFIX}{run_id}/{pipeline}")
    }

    pub fn run_prefix(run_id: &str) -> String {
        format!("{RUNS_PREFIX}{run_id}/")
    }

    pub fn is_terminal(&self) -> bool {
        self.status != RunStatus::Running
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
