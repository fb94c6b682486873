//! OpenAPI documentation and schema generation
//!
//! This module defines the OpenAPI specification for the vault-ingest REST API
//! using utoipa for compile-time spec generation.

use utoipa::OpenApi;

/// OpenAPI documentation for the vault-ingest REST API
///
/// The document is served at:
/// - `/api/v1/openapi.json` - JSON format OpenAPI specification
/// - `/swagger-ui` - Interactive Swagger UI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "vault-ingest REST API",
        version = "0.1.0",
        description = "REST API for submitting encrypted page ingestion jobs and following their progress",
        license(
            name = "MIT OR Apache-2.0"
        )
    ),
    servers(
        (url = "http://localhost:6790/api/v1", description = "Local development server")
    ),
    paths(
        // Jobs
        crate::api::routes::list_jobs,
        crate::api::routes::get_job,
        crate::api::routes::add_job,
        crate::api::routes::stop_job,
        crate::api::routes::start_job,
        crate::api::routes::remove_job,
        crate::api::routes::clear_completed,

        // System
        crate::api::routes::health_check,
        crate::api::routes::openapi_spec,
        crate::api::routes::event_stream,
    ),
    components(schemas(
        crate::types::JobId,
        crate::types::JobStatus,
        crate::types::JobMeta,
        crate::types::JobSnapshot,
        crate::types::DirectDownloadOptions,
        crate::types::Event,

        crate::api::routes::AddJobRequest,
        crate::api::routes::AddJobResponse,
        crate::api::routes::ClearCompletedResponse,

        crate::error::ApiError,
        crate::error::ErrorDetail,
    )),
    tags(
        (name = "jobs", description = "Ingestion jobs - Submit, stop, restart, remove and inspect"),
        (name = "system", description = "System endpoints - Health checks, OpenAPI spec, events"),
    )
)]
pub struct ApiDoc;
