//! Failover routes served through the axum router

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, header};
use http_body_util::BodyExt;
use pg_upgrade_operator::api::failover::{
    Authenticator, CreateFailoverRequest, CreateFailoverResponse, FailoverApiError,
    FailoverService, FailoverState, FailoverTarget, PGO_VERSION, QueryFailoverResponse,
    ResponseCode, Status, VERSION_MISMATCH_ERROR, router,
};
use serde::de::DeserializeOwned;
use tower::ServiceExt;

/// Accepts a single bearer token and maps every user to one namespace
struct TokenAuth;

#[async_trait]
impl Authenticator for TokenAuth {
    async fn authorize(
        &self,
        headers: &HeaderMap,
        _permission: &str,
    ) -> Result<String, FailoverApiError> {
        match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            Some("Bearer admin") => Ok("admin".to_string()),
            _ => Err(FailoverApiError::Unauthorized("invalid credentials".to_string())),
        }
    }

    async fn namespace_for(&self, _username: &str) -> Result<String, FailoverApiError> {
        Ok("db".to_string())
    }
}

#[derive(Default)]
struct RecordingService {
    calls: AtomicUsize,
}

#[async_trait]
impl FailoverService for RecordingService {
    async fn create_failover(
        &self,
        request: &CreateFailoverRequest,
        namespace: &str,
    ) -> CreateFailoverResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        CreateFailoverResponse {
            results: vec![format!(
                "failover of {}/{} to {} scheduled",
                namespace, request.cluster_name, request.target
            )],
            status: Status::ok(),
        }
    }

    async fn query_failover(&self, name: &str, _namespace: &str) -> QueryFailoverResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        QueryFailoverResponse {
            results: vec![format!("targets for {}", name)],
            targets: vec![FailoverTarget {
                name: format!("{}-b", name),
                ready_status: "Ready".to_string(),
                node: "node-1".to_string(),
                rep_status: "streaming".to_string(),
                receive_location: 100,
                replay_location: 90,
            }],
            status: Status::ok(),
        }
    }
}

fn app() -> (axum::Router, Arc<RecordingService>) {
    let service = Arc::new(RecordingService::default());
    let state = FailoverState {
        authenticator: Arc::new(TokenAuth),
        service: service.clone(),
    };
    (router(state), service)
}

fn create_request(token: Option<&str>, body: String) -> Request<Body> {
    let mut builder = Request::post("/failover").header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body)).unwrap()
}

async fn json_body<T: DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn create_body(version: &str) -> String {
    serde_json::json!({
        "clientVersion": version,
        "clusterName": "pg",
        "target": "pg-b"
    })
    .to_string()
}

#[tokio::test]
async fn test_create_failover_route() {
    let (app, service) = app();
    let response = app
        .oneshot(create_request(Some("admin"), create_body(PGO_VERSION)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: CreateFailoverResponse = json_body(response).await;
    assert_eq!(body.status.code, ResponseCode::Ok);
    assert_eq!(body.results, vec!["failover of db/pg to pg-b scheduled"]);
    assert_eq!(service.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_credentials_are_rejected() {
    let (app, service) = app();
    let response = app
        .oneshot(create_request(None, create_body(PGO_VERSION)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    assert_eq!(service.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_version_mismatch_is_reported_in_status() {
    let (app, service) = app();
    let response = app
        .oneshot(create_request(Some("admin"), create_body("0.0.1-old")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: CreateFailoverResponse = json_body(response).await;
    assert_eq!(body.status, Status::error(VERSION_MISMATCH_ERROR));
    assert!(body.results.is_empty());
    assert_eq!(service.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_body_fails_version_check() {
    let (app, service) = app();
    let response = app
        .oneshot(create_request(Some("admin"), "{not json".to_string()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: CreateFailoverResponse = json_body(response).await;
    assert_eq!(body.status.msg, VERSION_MISMATCH_ERROR);
    assert_eq!(service.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_query_failover_route() {
    let (app, _) = app();
    let request = Request::get(format!("/failover/pg?version={}", PGO_VERSION))
        .header(header::AUTHORIZATION, "Bearer admin")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: QueryFailoverResponse = json_body(response).await;
    assert_eq!(body.status.code, ResponseCode::Ok);
    assert_eq!(body.targets.len(), 1);
    assert_eq!(body.targets[0].name, "pg-b");
    assert_eq!(body.targets[0].replay_location, 90);
}

#[tokio::test]
async fn test_query_without_version_is_mismatch() {
    let (app, service) = app();
    let request = Request::get("/failover/pg")
        .header(header::AUTHORIZATION, "Bearer admin")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    let body: QueryFailoverResponse = json_body(response).await;
    assert_eq!(body.status.msg, VERSION_MISMATCH_ERROR);
    assert_eq!(service.calls.load(Ordering::SeqCst), 0);
}
