//! Main axum router and HTTP request handlers for the ECR proxy.
//!
//! Routes:
//! - `ANY /v2/` and `ANY /v2/{*rest}` - Registry API, forwarded to ECR
//! - `GET /healthz`                    - Liveness
//! - `GET /readyz`                     - Readiness (credential validity)
//! - `GET /metrics`                    - Prometheus metrics

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use tracing::{error, instrument, warn};

use super::authorizer::{authorize, AuthorizeError};
use super::forward::{forward, OutboundRequest};
use super::request_log::log_request;
use crate::health::HealthState;
use crate::metrics::StatusLabels;
use crate::AppState;

/// Registry version check.  Clients poll it constantly, so it is not logged.
const REGISTRY_PING_PATH: &str = "/v2/";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
///
/// Handlers read the peer address through `ConnectInfo<SocketAddr>`, which
/// the TLS server inserts per connection.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(REGISTRY_PING_PATH, any(handle_registry))
        .route("/v2/{*rest}", any(handle_registry))
        .route("/healthz", get(crate::health::liveness_handler))
        .route("/readyz", get(handle_ready))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Gate on the allow-list, stamp the registry credential and relay.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
async fn handle_registry(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
) -> Result<Response, AppError> {
    if let Some(allow_list) = &state.allow_list {
        if !allow_list.allows(&remote.to_string()) {
            state.metrics.metrics.access_denied_total.inc();
            log_request(
                request.method(),
                request.uri().path(),
                request.headers(),
                remote,
                "Denied request from IP (not in whitelist)",
            );
            return Err(AppError::Forbidden);
        }
    }

    if request.uri().path() != REGISTRY_PING_PATH {
        log_request(
            request.method(),
            request.uri().path(),
            request.headers(),
            remote,
            "proxy to ECR",
        );
    }

    let (parts, body) = request.into_parts();
    let mut outbound = OutboundRequest::from_inbound(&parts, body, remote.ip());

    authorize(&state.credentials, &mut outbound)
        .await
        .map_err(|e| match e {
            AuthorizeError::NoUsableCredential(_) => AppError::Unavailable(e.to_string()),
            AuthorizeError::InvalidHeader(_) => AppError::Internal(e.into()),
        })?;

    let response = forward(&state.http_client, outbound)
        .await
        .map_err(AppError::BadGateway)?;

    state
        .metrics
        .metrics
        .forwarded_requests_total
        .get_or_create(&StatusLabels::from_status(response.status().as_u16()))
        .inc();

    Ok(response)
}

/// `GET /readyz`
async fn handle_ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = HealthState {
        credentials: Arc::clone(&state.credentials),
    };
    crate::health::readiness_handler(State(health_state)).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The client address is not on the allow-list.
    Forbidden,
    /// No credential the registry would accept.
    Unavailable(String),
    /// The registry could not be reached.
    BadGateway(anyhow::Error),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden").into_response(),
            AppError::Unavailable(msg) => {
                error!(error = %msg, "rejecting request, no usable registry credential");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Registry credential unavailable",
                )
                    .into_response()
            }
            AppError::BadGateway(err) => {
                warn!(error = %format!("{err:#}"), "registry unreachable");
                (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
            }
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
