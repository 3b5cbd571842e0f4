//! JSON-Schema validation of resource specs.
//!
//! A definition's `schema` is compiled on every call; schemas are small
//! and definitions change rarely, so no compiled-validator cache is kept.

use jsonschema::Validator;
use thiserror::Error;

use crate::types::{Resource, ResourceDefinition};

/// Errors produced while validating a resource against its definition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("invalid schema for resource definition '{definition}': {reason}")]
    Compile { definition: String, reason: String },

    #[error("resource '{resource}' does not satisfy schema: {}", .violations.join("; "))]
    Invalid {
        resource: String,
        violations: Vec<String>,
    },

    #[error("resource type '{actual}' does not match definition '{expected}'")]
    TypeMismatch { expected: String, actual: String },
}

/// Compile a definition's schema, rejecting malformed documents.
pub fn compile(definition: &ResourceDefinition) -> Result<Validator, SchemaError> {
    jsonschema::validator_for(&definition.schema).map_err(|e| SchemaError::Compile {
        definition: definition.name.clone(),
        reason: e.to_string(),
    })
}

/// Validate `resource.spec` against `definition.schema`.
pub fn validate(resource: &Resource, definition: &ResourceDefinition) -> Result<(), SchemaError> {
    if resource.resource != definition.name {
        return Err(SchemaError::TypeMismatch {
            expected: definition.name.clone(),
            actual: resource.resource.clone(),
        });
    }

    let validator = compile(definition)?;
    let violations: Vec<String> = validator
        .iter_errors(&resource.spec)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{path}: {e}")
            }
        })
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(SchemaError::Invalid {
            resource: resource.name.clone(),
            violations,
        })
    }
}
