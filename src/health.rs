use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::credentials::CredentialManager;

/// Readiness detail when the credential is past its refresh point.
pub const NOT_READY_DETAIL: &str = "ECR token is not valid or expired";

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub status: HealthStatus,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: HealthStatus,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub credential: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handlers
// ---------------------------------------------------------------------------

/// Minimal subset of `AppState` the health handlers need.
#[derive(Clone)]
pub struct HealthState {
    pub credentials: Arc<CredentialManager>,
}

fn check_credential(credentials: &CredentialManager) -> CheckResult {
    let credential = credentials.snapshot();
    if credential.is_valid_at(Utc::now()) {
        CheckResult::healthy(format!("refresh due at {}", credential.expires_at()))
    } else {
        CheckResult::unhealthy(NOT_READY_DETAIL)
    }
}

// ---------------------------------------------------------------------------
// Axum handlers
// ---------------------------------------------------------------------------

/// `GET /healthz`.  The process is up; always 200.
pub async fn liveness_handler() -> impl IntoResponse {
    Json(LivenessResponse {
        status: HealthStatus::Ok,
    })
}

/// `GET /readyz`.  200 while the held credential is valid, 503 otherwise.
/// Never fetches.
pub async fn readiness_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let credential = check_credential(&state.credentials);
    let (http_status, status) = if credential.ok {
        (StatusCode::OK, HealthStatus::Ok)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, HealthStatus::Unhealthy)
    };

    (
        http_status,
        Json(ReadinessResponse {
            status,
            checks: ReadinessChecks { credential },
        }),
    )
}
