//! Upstream authorization source abstraction.
//!
//! The [`AuthorizationSource`] trait models the registry's "get authorization
//! token" call.  Records are returned exactly as the upstream reports them,
//! with every field optional, so that the credential manager can decide what
//! counts as a usable credential.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// One authorization record as returned by the upstream service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationRecord {
    /// Base64 `user:password` token, used verbatim after `Basic `.
    pub token: Option<String>,
    /// Raw upstream expiry of the token.
    pub expires_at: Option<DateTime<Utc>>,
    /// Registry URL, usually `https://<account>.dkr.ecr.<region>.amazonaws.com`.
    pub proxy_endpoint: Option<String>,
}

/// Errors fetching or validating an upstream credential.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("authorization request failed: {0}")]
    Upstream(String),

    #[error("no authorization data returned from ECR")]
    NoAuthorizationData,

    #[error("authorization token is missing")]
    MissingToken,

    #[error("expiration time is missing")]
    MissingExpiry,

    #[error("proxy endpoint is missing")]
    MissingEndpoint,

    #[error("credential is already due for refresh (expires_at {expires_at})")]
    AlreadyExpired { expires_at: DateTime<Utc> },
}

/// Something that can hand out registry authorization records.
#[async_trait::async_trait]
pub trait AuthorizationSource: Send + Sync {
    /// Call the upstream authorization endpoint for the configured registry.
    async fn fetch_authorization(&self) -> Result<Vec<AuthorizationRecord>, FetchError>;
}
