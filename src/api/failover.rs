//! HTTP boundary for failover requests
//!
//! Handlers decode the request, authorize the caller, check the client
//! protocol version and hand off to a [`FailoverService`]. Failover
//! decisions themselves live behind that trait.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Protocol version clients must send
pub const PGO_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Status message returned when the client version does not match
pub const VERSION_MISMATCH_ERROR: &str = "client and server version mismatch";

/// Permission required to create or query a failover
pub const CREATE_FAILOVER_PERM: &str = "CreateFailover";

/// Outcome code carried in every response
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseCode {
    #[default]
    Ok,
    Error,
}

/// Response status
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Status {
    pub code: ResponseCode,
    pub msg: String,
}

impl Status {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            code: ResponseCode::Error,
            msg: msg.into(),
        }
    }
}

/// Request to fail a cluster over to a target instance
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateFailoverRequest {
    pub client_version: String,
    pub cluster_name: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autofail_flag: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateFailoverResponse {
    pub results: Vec<String>,
    pub status: Status,
}

/// A failover candidate as reported by the failover service
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FailoverTarget {
    pub name: String,
    pub ready_status: String,
    pub node: String,
    pub rep_status: String,
    pub receive_location: u64,
    pub replay_location: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueryFailoverResponse {
    pub results: Vec<String>,
    pub targets: Vec<FailoverTarget>,
    pub status: Status,
}

/// Errors raised at the API boundary
#[derive(Error, Debug)]
pub enum FailoverApiError {
    /// The caller could not be authenticated or lacks the permission
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The caller's namespace could not be resolved
    #[error("{0}")]
    Namespace(String),
}

impl IntoResponse for FailoverApiError {
    fn into_response(self) -> Response {
        match self {
            FailoverApiError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, r#"Basic realm="Restricted""#)],
                msg,
            )
                .into_response(),
            FailoverApiError::Namespace(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
        }
    }
}

/// Authenticates callers and scopes them to a namespace
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Check the request headers grant `permission`; returns the username
    async fn authorize(
        &self,
        headers: &HeaderMap,
        permission: &str,
    ) -> Result<String, FailoverApiError>;

    /// Namespace the user may act in
    async fn namespace_for(&self, username: &str) -> Result<String, FailoverApiError>;
}

/// Failover decision logic
#[async_trait]
pub trait FailoverService: Send + Sync {
    async fn create_failover(
        &self,
        request: &CreateFailoverRequest,
        namespace: &str,
    ) -> CreateFailoverResponse;

    async fn query_failover(&self, name: &str, namespace: &str) -> QueryFailoverResponse;
}

/// Collaborators shared by the failover handlers
#[derive(Clone)]
pub struct FailoverState {
    pub authenticator: Arc<dyn Authenticator>,
    pub service: Arc<dyn FailoverService>,
}

/// Handle a create-failover request.
///
/// Authorization failures are returned as errors; everything after that is
/// reported in the response status.
pub async fn create_failover(
    state: &FailoverState,
    headers: &HeaderMap,
    request: CreateFailoverRequest,
) -> Result<CreateFailoverResponse, FailoverApiError> {
    let username = state
        .authenticator
        .authorize(headers, CREATE_FAILOVER_PERM)
        .await?;

    if request.client_version != PGO_VERSION {
        return Ok(CreateFailoverResponse {
            results: Vec::new(),
            status: Status::error(VERSION_MISMATCH_ERROR),
        });
    }

    let namespace = match state.authenticator.namespace_for(&username).await {
        Ok(ns) => ns,
        Err(e) => {
            return Ok(CreateFailoverResponse {
                results: Vec::new(),
                status: Status::error(e.to_string()),
            });
        }
    };

    debug!(cluster = %request.cluster_name, %namespace, "Delegating failover request");
    Ok(state.service.create_failover(&request, &namespace).await)
}

/// Handle a query-failover request for the cluster `name`
pub async fn query_failover(
    state: &FailoverState,
    headers: &HeaderMap,
    name: &str,
    client_version: Option<&str>,
) -> Result<QueryFailoverResponse, FailoverApiError> {
    let username = state
        .authenticator
        .authorize(headers, CREATE_FAILOVER_PERM)
        .await?;

    if client_version != Some(PGO_VERSION) {
        return Ok(QueryFailoverResponse {
            status: Status::error(VERSION_MISMATCH_ERROR),
            ..Default::default()
        });
    }

    let namespace = match state.authenticator.namespace_for(&username).await {
        Ok(ns) => ns,
        Err(e) => {
            return Ok(QueryFailoverResponse {
                status: Status::error(e.to_string()),
                ..Default::default()
            });
        }
    };

    Ok(state.service.query_failover(name, &namespace).await)
}

#[derive(Deserialize, Debug, Default)]
struct VersionQuery {
    version: Option<String>,
}

async fn create_failover_handler(
    State(state): State<FailoverState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CreateFailoverResponse>, FailoverApiError> {
    // Malformed bodies decode to an empty request and fail the version check
    let request: CreateFailoverRequest = serde_json::from_slice(&body).unwrap_or_default();
    create_failover(&state, &headers, request).await.map(Json)
}

async fn query_failover_handler(
    State(state): State<FailoverState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(query): Query<VersionQuery>,
) -> Result<Json<QueryFailoverResponse>, FailoverApiError> {
    query_failover(&state, &headers, &name, query.version.as_deref())
        .await
        .map(Json)
}

/// Router serving `POST /failover` and `GET /failover/{name}`
pub fn router(state: FailoverState) -> Router {
    Router::new()
        .route("/failover", post(create_failover_handler))
        .route("/failover/{name}", get(query_failover_handler))
        .with_state(state)
}
