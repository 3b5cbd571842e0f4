//! REST API handlers.
//!
//! Handlers are thin: they unpack the request, call [`ResourceService`]
//! and map the outcome to a status code. Errors render as
//! `{"error": "..."}`.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::error;

use rekon_core::{Pipeline, Resource, ResourceDefinition};

use crate::ApiState;
use crate::service::ServiceError;

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult = Result<Response, ServiceError>;

/// JSON body extractor whose rejections are validation errors, so a
/// malformed or incomplete body gets a 400 with the usual error body.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ServiceError::Validation(rejection.body_text())),
        }
    }
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ── Resource definitions ───────────────────────────────────────

/// POST /resource-definitions
pub async fn create_resource_definition(
    State(state): State<ApiState>,
    ApiJson(def): ApiJson<ResourceDefinition>,
) -> ApiResult {
    let def = state.service.create_resource_definition(def).await?;
    Ok((StatusCode::CREATED, Json(def)).into_response())
}

/// POST /resource-definitions/apply
pub async fn apply_resource_definition(
    State(state): State<ApiState>,
    ApiJson(def): ApiJson<ResourceDefinition>,
) -> ApiResult {
    let (def, _created) = state.service.apply_resource_definition(def).await?;
    Ok(Json(def).into_response())
}

/// GET /resource-definitions
pub async fn list_resource_definitions(State(state): State<ApiState>) -> ApiResult {
    Ok(Json(state.service.list_resource_definitions().await?).into_response())
}

/// GET /resource-definitions/{name}
pub async fn get_resource_definition(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult {
    Ok(Json(state.service.get_resource_definition(&name).await?).into_response())
}

/// PUT /resource-definitions/{name}
pub async fn update_resource_definition(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    ApiJson(def): ApiJson<ResourceDefinition>,
) -> ApiResult {
    Ok(Json(state.service.update_resource_definition(&name, def).await?).into_response())
}

/// DELETE /resource-definitions/{name}
pub async fn delete_resource_definition(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult {
    state.service.delete_resource_definition(&name).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ── Resources ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ResourceQuery {
    #[serde(rename = "type")]
    pub resource_type: Option<String>,
}

/// POST /resources
pub async fn create_resource(
    State(state): State<ApiState>,
    ApiJson(resource): ApiJson<Resource>,
) -> ApiResult {
    let change = state.service.create_resource(resource).await?;
    Ok((StatusCode::CREATED, Json(change)).into_response())
}

/// GET /resources?type=
pub async fn list_resources(
    State(state): State<ApiState>,
    Query(query): Query<ResourceQuery>,
) -> ApiResult {
    Ok(Json(state.service.list_resources(query.resource_type).await?).into_response())
}

/// GET /resources/{type}/{name}
pub async fn get_resource(
    State(state): State<ApiState>,
    Path((resource_type, name)): Path<(String, String)>,
) -> ApiResult {
    Ok(Json(state.service.get_resource(&resource_type, &name).await?).into_response())
}

/// PUT /resources/{type}/{name}
pub async fn update_resource(
    State(state): State<ApiState>,
    Path((resource_type, name)): Path<(String, String)>,
    ApiJson(resource): ApiJson<Resource>,
) -> ApiResult {
    let change = state
        .service
        .update_resource(&resource_type, &name, resource)
        .await?;
    Ok(Json(change).into_response())
}

/// DELETE /resources/{type}/{name}
pub async fn delete_resource(
    State(state): State<ApiState>,
    Path((resource_type, name)): Path<(String, String)>,
) -> ApiResult {
    state.service.delete_resource(&resource_type, &name).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ── Pipelines ──────────────────────────────────────────────────

/// POST /pipelines
pub async fn create_pipeline(
    State(state): State<ApiState>,
    ApiJson(pipeline): ApiJson<Pipeline>,
) -> ApiResult {
    let pipeline = state.service.create_pipeline(pipeline).await?;
    Ok((StatusCode::CREATED, Json(pipeline)).into_response())
}

/// GET /pipelines
pub async fn list_pipelines(State(state): State<ApiState>) -> ApiResult {
    Ok(Json(state.service.list_pipelines().await?).into_response())
}

/// GET /pipelines/{name}
pub async fn get_pipeline(State(state): State<ApiState>, Path(name): Path<String>) -> ApiResult {
    Ok(Json(state.service.get_pipeline(&name).await?).into_response())
}

/// PUT /pipelines/{name}
pub async fn update_pipeline(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    ApiJson(pipeline): ApiJson<Pipeline>,
) -> ApiResult {
    Ok(Json(state.service.update_pipeline(&name, pipeline).await?).into_response())
}

/// DELETE /pipelines/{name}
pub async fn delete_pipeline(State(state): State<ApiState>, Path(name): Path<String>) -> ApiResult {
    state.service.delete_pipeline(&name).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ── Runs ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RunQuery {
    pub run_id: Option<String>,
}

/// GET /runs?run_id=
pub async fn list_runs(State(state): State<ApiState>, Query(query): Query<RunQuery>) -> ApiResult {
    Ok(Json(state.service.list_runs(query.run_id).await?).into_response())
}

/// GET /runs/{run_id}
pub async fn get_run(State(state): State<ApiState>, Path(run_id): Path<String>) -> ApiResult {
    Ok(Json(state.service.get_run(&run_id).await?).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;

    use rekon_bus::RecordingPublisher;
    use rekon_state::StateStore;
    use serde_json::json;

    use crate::service::ResourceService;

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        ApiState {
            service: ResourceService::new(store, Arc::new(RecordingPublisher::new())),
        }
    }

    fn definition() -> ResourceDefinition {
        serde_json::from_value(json!({
            "name": "pipe",
            "schema": {"type": "object", "required": ["replicas"]}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn healthz_ok() {
        let resp = healthz().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_and_get_definition() {
        let state = test_state();
        let resp = create_resource_definition(State(state.clone()), ApiJson(definition()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = get_resource_definition(State(state.clone()), Path("pipe".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = create_resource_definition(State(state), ApiJson(definition()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn missing_resource_is_404() {
        let state = test_state();
        let resp = get_resource(State(state), Path(("pipe".to_string(), "p1".to_string())))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_spec_is_400() {
        let state = test_state();
        create_resource_definition(State(state.clone()), ApiJson(definition()))
            .await
            .unwrap();

        let resource: Resource =
            serde_json::from_value(json!({"name": "p1", "resource": "pipe", "spec": {}})).unwrap();
        let resp = create_resource(State(state), ApiJson(resource))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_definition_is_204() {
        let state = test_state();
        create_resource_definition(State(state.clone()), ApiJson(definition()))
            .await
            .unwrap();
        let resp = delete_resource_definition(State(state), Path("pipe".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    fn json_request(body: &str) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/resources")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn unparseable_bodies_are_validation_errors() {
        let missing_field = ApiJson::<Resource>::from_request(json_request(r#"{"name":"p1"}"#), &())
            .await
            .unwrap_err();
        assert!(matches!(missing_field, ServiceError::Validation(_)));
        assert_eq!(missing_field.into_response().status(), StatusCode::BAD_REQUEST);

        let not_json = ApiJson::<Resource>::from_request(json_request("not json"), &())
            .await
            .unwrap_err();
        assert!(matches!(not_json, ServiceError::Validation(_)));

        let ApiJson(def) = ApiJson::<ResourceDefinition>::from_request(
            json_request(r#"{"name":"pipe","schema":{}}"#),
            &(),
        )
        .await
        .unwrap();
        assert_eq!(def.name, "pipe");
    }
}
