//! rekon-api — REST API for rekon.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET, POST | `/resource-definitions` | List / create definitions |
//! | POST | `/resource-definitions/apply` | Create or update a definition |
//! | GET, PUT, DELETE | `/resource-definitions/{name}` | Read / replace / delete |
//! | GET, POST | `/resources` | List (`?type=`) / create resources |
//! | GET, PUT, DELETE | `/resources/{type}/{name}` | Read / replace / delete |
//! | GET, POST | `/pipelines` | List / create pipelines |
//! | GET, PUT, DELETE | `/pipelines/{name}` | Read / replace / delete |
//! | GET | `/runs` | List runs (`?run_id=`) |
//! | GET | `/runs/{run_id}` | Every pipeline run of one run id |
//! | GET | `/healthz` | Liveness |

pub mod handlers;
pub mod service;

use axum::Router;
use axum::routing::{get, post};

pub use service::{ResourceChange, ResourceService, ServiceError, ServiceResult};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub service: ResourceService,
}

/// Build the complete API router.
pub fn build_router(service: ResourceService) -> Router {
    let state = ApiState { service };

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route(
            "/resource-definitions",
            get(handlers::list_resource_definitions).post(handlers::create_resource_definition),
        )
        .route(
            "/resource-definitions/apply",
            post(handlers::apply_resource_definition),
        )
        .route(
            "/resource-definitions/{name}",
            get(handlers::get_resource_definition)
                .put(handlers::update_resource_definition)
                .delete(handlers::delete_resource_definition),
        )
        .route(
            "/resources",
            get(handlers::list_resources).post(handlers::create_resource),
        )
        .route(
            "/resources/{type}/{name}",
            get(handlers::get_resource)
                .put(handlers::update_resource)
                .delete(handlers::delete_resource),
        )
        .route(
            "/pipelines",
            get(handlers::list_pipelines).post(handlers::create_pipeline),
        )
        .route(
            "/pipelines/{name}",
            get(handlers::get_pipeline)
                .put(handlers::update_pipeline)
                .delete(handlers::delete_pipeline),
        )
        .route("/runs", get(handlers::list_runs))
        .route("/runs/{run_id}", get(handlers::get_run))
        .with_state(state)
}
