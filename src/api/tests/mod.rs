use super::*;
use crate::manager::test_helpers::{mount_page, png_page, wait_for_status};
use crate::types::{JobId, JobSnapshot, JobStatus};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::time::Duration;
use tower::ServiceExt;


/// Helper to create a test JobManager instance wrapped in Arc
async fn create_test_manager() -> (Arc<JobManager>, tempfile::TempDir) {
    let (manager, temp_dir) = crate::manager::test_helpers::create_test_manager().await;
    (Arc::new(manager), temp_dir)
}

fn router_for(manager: &Arc<JobManager>) -> Router {
    create_router(manager.clone(), manager.get_config())
}

async fn json_body<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).expect("Response should be valid JSON")
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_api_server_spawns() {
    let (manager, _temp_dir) = create_test_manager().await;

    let mut config = (*manager.get_config()).clone();
    config.server.api.bind_address = "127.0.0.1:0".parse().unwrap();
    let config = Arc::new(config);

    let api_handle = tokio::spawn({
        let manager = manager.clone();
        async move { start_api_server(manager, config).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!api_handle.is_finished(), "server exited early");
    api_handle.abort();
}

#[tokio::test]
async fn test_cors_headers_follow_config() {
    let (manager, _temp_dir) = create_test_manager().await;

    // Off by default
    let request = Request::builder()
        .uri("/health")
        .header("Origin", "http://evil.example")
        .body(Body::empty())
        .unwrap();
    let response = router_for(&manager).oneshot(request).await.unwrap();
    assert!(!response.headers().contains_key("access-control-allow-origin"));

    let mut config = (*manager.get_config()).clone();
    config.server.api.cors_enabled = true;
    config.server.api.cors_origins = vec!["http://localhost:3000".to_string()];
    let app = create_router(manager.clone(), Arc::new(config.clone()));

    let request = Request::builder()
        .uri("/health")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "http://localhost:3000"
    );

    config.server.api.cors_enabled = false;
    let app = create_router(manager, Arc::new(config));
    let request = Request::builder()
        .uri("/health")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert!(!response.headers().contains_key("access-control-allow-origin"));
}

#[tokio::test]
async fn test_swagger_ui_is_optional() {
    let (manager, _temp_dir) = create_test_manager().await;

    let response = router_for(&manager)
        .oneshot(empty("GET", "/swagger-ui/"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut config = (*manager.get_config()).clone();
    config.server.api.swagger_ui = false;
    let response = create_router(manager, Arc::new(config))
        .oneshot(empty("GET", "/swagger-ui/"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
