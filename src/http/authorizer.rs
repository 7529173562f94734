//! Stamps outbound registry requests with the current credential.

use std::sync::Arc;

use axum::http::header::{self, HeaderValue, InvalidHeaderValue};
use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use crate::credentials::{Credential, CredentialManager, RefreshError};

use super::forward::OutboundRequest;

#[derive(Debug, Error)]
pub enum AuthorizeError {
    /// The credential was due, refreshing it failed, and the upstream would
    /// reject the stale one too.
    #[error("no usable registry credential: {0}")]
    NoUsableCredential(#[from] RefreshError),

    #[error("credential cannot be sent as a header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
}

/// Point `request` at the registry and attach `Authorization: Basic <token>`.
///
/// Refreshes inline when the credential is due.  If that refresh fails but
/// the upstream would still accept the old token, the old token is used.
pub async fn authorize(
    credentials: &CredentialManager,
    request: &mut OutboundRequest,
) -> Result<Arc<Credential>, AuthorizeError> {
    let credential = match credentials.fresh_snapshot().await {
        Ok(credential) => credential,
        Err(e) if e.stale.is_usable_at(Utc::now()) => {
            warn!(
                error = %e.source,
                upstream_expires_at = %e.stale.upstream_expires_at(),
                "forwarding with last known credential"
            );
            e.stale
        }
        Err(e) => return Err(e.into()),
    };

    stamp(request, &credential)?;
    Ok(credential)
}

fn stamp(request: &mut OutboundRequest, credential: &Credential) -> Result<(), InvalidHeaderValue> {
    let host = HeaderValue::from_str(credential.endpoint_host())?;
    let mut authorization = HeaderValue::from_str(&credential.authorization_header())?;
    authorization.set_sensitive(true);

    request.scheme = "https";
    request.host = credential.endpoint_host().to_owned();
    request.headers.insert(header::HOST, host);
    request.headers.insert(header::AUTHORIZATION, authorization);
    Ok(())
}
