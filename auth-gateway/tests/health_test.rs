mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{read_json, TestApp};

#[tokio::test]
async fn health_reports_stores_and_providers() {
    let app = TestApp::spawn().await;
    let response = app
        .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    assert!(response.headers().contains_key("x-content-type-options"));

    let body = read_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["providers"], serde_json::json!(["google"]));
}

#[tokio::test]
async fn request_id_is_echoed() {
    let app = TestApp::spawn().await;
    let response = app
        .send(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "req-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.headers()["x-request-id"], "req-123");
}
