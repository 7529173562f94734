use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::source::{AuthorizationRecord, AuthorizationSource, FetchError};

/// ECR tokens live for 12 hours; treat them as due for refresh after 6.
pub const SAFETY_MARGIN_SECS: i64 = 6 * 60 * 60;

fn safety_margin() -> TimeDelta {
    TimeDelta::seconds(SAFETY_MARGIN_SECS)
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// An immutable registry credential.  Refreshing replaces the whole value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    endpoint_host: String,
    expires_at: DateTime<Utc>,
    upstream_expires_at: DateTime<Utc>,
}

impl Credential {
    /// Build a credential from the first upstream record.
    ///
    /// Every field must be present.  The endpoint loses its `https://`
    /// scheme and the expiry is pulled forward by the safety margin.
    pub fn from_records(records: Vec<AuthorizationRecord>) -> Result<Self, FetchError> {
        let record = records
            .into_iter()
            .next()
            .ok_or(FetchError::NoAuthorizationData)?;

        let token = record
            .token
            .filter(|t| !t.is_empty())
            .ok_or(FetchError::MissingToken)?;
        let upstream_expires_at = record.expires_at.ok_or(FetchError::MissingExpiry)?;
        let endpoint = record
            .proxy_endpoint
            .filter(|e| !e.is_empty())
            .ok_or(FetchError::MissingEndpoint)?;

        Ok(Self {
            token,
            endpoint_host: strip_scheme(&endpoint).to_owned(),
            expires_at: upstream_expires_at - safety_margin(),
            upstream_expires_at,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Registry host without scheme, e.g. `123456789012.dkr.ecr.us-east-1.amazonaws.com`.
    pub fn endpoint_host(&self) -> &str {
        &self.endpoint_host
    }

    /// Instant at which the credential becomes due for refresh.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Instant at which the upstream itself stops accepting the token.
    pub fn upstream_expires_at(&self) -> DateTime<Utc> {
        self.upstream_expires_at
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.token.is_empty() && now < self.expires_at
    }

    /// Whether the upstream would still accept the token at `now`, even if it
    /// is past the refresh point.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        !self.token.is_empty() && now < self.upstream_expires_at
    }

    /// `Authorization` header value for requests to the registry.
    pub fn authorization_header(&self) -> String {
        format!("Basic {}", self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("endpoint_host", &self.endpoint_host)
            .field("expires_at", &self.expires_at)
            .field("upstream_expires_at", &self.upstream_expires_at)
            .finish()
    }
}

fn strip_scheme(endpoint: &str) -> &str {
    endpoint.strip_prefix("https://").unwrap_or(endpoint)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A lazy refresh failed while the held credential was already due.
///
/// The stale credential rides along so that callers can decide whether it is
/// still good enough to use.
#[derive(Debug, Error)]
#[error("credential refresh failed: {source}")]
pub struct RefreshError {
    #[source]
    pub source: FetchError,
    pub stale: Arc<Credential>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns the process-wide registry credential.
///
/// Reads clone an `Arc` under a short read lock.  Fetches run with no lock
/// held; only the final swap takes the write lock.  `refresh_gate` serialises
/// fetches and remembers the last failure, so concurrent stale readers
/// trigger a single upstream call whether it succeeds or not.
pub struct CredentialManager {
    source: Arc<dyn AuthorizationSource>,
    current: RwLock<Arc<Credential>>,
    refresh_gate: Mutex<Option<FetchError>>,
    /// Completed fetch attempts.  Only bumped with `refresh_gate` held.
    attempts: AtomicU64,
}

impl CredentialManager {
    /// Perform the initial fetch.  Fails if the upstream errors or hands back
    /// a credential that is already due for refresh.
    pub async fn new(source: Arc<dyn AuthorizationSource>) -> Result<Self, FetchError> {
        let credential = fetch_credential(source.as_ref()).await?;
        if !credential.is_valid_at(Utc::now()) {
            return Err(FetchError::AlreadyExpired {
                expires_at: credential.expires_at(),
            });
        }
        info!(
            endpoint = %credential.endpoint_host(),
            expires_at = %credential.expires_at(),
            "initial registry credential fetched"
        );
        Ok(Self::with_credential(source, credential))
    }

    pub(crate) fn with_credential(
        source: Arc<dyn AuthorizationSource>,
        credential: Credential,
    ) -> Self {
        Self {
            source,
            current: RwLock::new(Arc::new(credential)),
            refresh_gate: Mutex::new(None),
            attempts: AtomicU64::new(0),
        }
    }

    /// The current credential, whatever its freshness.
    pub fn snapshot(&self) -> Arc<Credential> {
        // A poisoned lock still holds a whole Arc; there is no partial state.
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&*guard)
    }

    pub fn current_endpoint(&self) -> String {
        self.snapshot().endpoint_host().to_owned()
    }

    /// Cheap readiness check.  Never fetches.
    pub fn is_valid(&self) -> bool {
        self.snapshot().is_valid_at(Utc::now())
    }

    pub async fn current_token(&self) -> Result<String, RefreshError> {
        Ok(self.fresh_snapshot().await?.token().to_owned())
    }

    /// The current credential, refreshed first if it is due.
    pub async fn fresh_snapshot(&self) -> Result<Arc<Credential>, RefreshError> {
        let seen_attempts = self.attempts.load(Ordering::Acquire);
        let current = self.snapshot();
        if current.is_valid_at(Utc::now()) {
            return Ok(current);
        }

        let mut gate = self.refresh_gate.lock().await;

        // Another caller may have refreshed while we waited.
        let current = self.snapshot();
        if current.is_valid_at(Utc::now()) {
            debug!("credential already refreshed by another caller");
            return Ok(current);
        }

        // An attempt finished while we waited; share its outcome.
        if self.attempts.load(Ordering::Acquire) != seen_attempts {
            debug!("sharing outcome of concurrent refresh");
            return match gate.clone() {
                Some(source) => Err(RefreshError {
                    source,
                    stale: current,
                }),
                None => Ok(current),
            };
        }

        info!(expires_at = %current.expires_at(), "credential due, refreshing inline");
        self.refresh_locked(&mut gate).await.map_err(|source| {
            warn!(error = %source, "inline credential refresh failed");
            RefreshError {
                source,
                stale: current,
            }
        })
    }

    /// Unconditionally fetch and publish a new credential.  On failure the
    /// existing credential stays in place.
    pub async fn refresh(&self) -> Result<Arc<Credential>, FetchError> {
        let mut gate = self.refresh_gate.lock().await;
        self.refresh_locked(&mut gate).await
    }

    #[instrument(skip_all)]
    async fn refresh_locked(
        &self,
        last_failure: &mut Option<FetchError>,
    ) -> Result<Arc<Credential>, FetchError> {
        let fetched = fetch_credential(self.source.as_ref()).await;
        *last_failure = fetched.as_ref().err().cloned();
        self.attempts.fetch_add(1, Ordering::Release);

        let credential = fetched?;
        if !credential.is_valid_at(Utc::now()) {
            warn!(
                upstream_expires_at = %credential.upstream_expires_at(),
                "registry issued a credential inside the safety margin"
            );
        }
        let published = self.publish(credential);
        debug!(
            endpoint = %published.endpoint_host(),
            expires_at = %published.expires_at(),
            "registry credential published"
        );
        Ok(published)
    }

    fn publish(&self, credential: Credential) -> Arc<Credential> {
        let credential = Arc::new(credential);
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::clone(&credential);
        credential
    }
}

/// Fetch a new credential.  One the upstream has already stopped accepting
/// is rejected; one that is merely inside the safety margin is kept.
async fn fetch_credential(source: &dyn AuthorizationSource) -> Result<Credential, FetchError> {
    let records = source.fetch_authorization().await?;
    let credential = Credential::from_records(records)?;
    if !credential.is_usable_at(Utc::now()) {
        return Err(FetchError::AlreadyExpired {
            expires_at: credential.expires_at(),
        });
    }
    Ok(credential)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    pub const ENDPOINT: &str = "https://123456789012.dkr.ecr.us-east-1.amazonaws.com";
    pub const HOST: &str = "123456789012.dkr.ecr.us-east-1.amazonaws.com";

    pub fn record(token: &str, expires_at: DateTime<Utc>) -> AuthorizationRecord {
        AuthorizationRecord {
            token: Some(token.to_owned()),
            expires_at: Some(expires_at),
            proxy_endpoint: Some(ENDPOINT.to_owned()),
        }
    }

    /// Scripted source: hands out `token-<n>` valid for `lifetime`, or fails
    /// while `fail` is set.
    pub struct FakeSource {
        pub calls: AtomicUsize,
        pub fail: AtomicBool,
        pub lifetime: TimeDelta,
        pub delay: Duration,
    }

    impl FakeSource {
        pub fn new() -> Arc<Self> {
            Self::with_delay(Duration::ZERO)
        }

        pub fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                lifetime: TimeDelta::hours(12),
                delay,
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl AuthorizationSource for FakeSource {
        async fn fetch_authorization(&self) -> Result<Vec<AuthorizationRecord>, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(FetchError::Upstream("service unavailable".into()));
            }
            Ok(vec![record(&format!("token-{n}"), Utc::now() + self.lifetime)])
        }
    }

    /// A credential that is past its refresh point but `upstream_left` away
    /// from real expiry.
    pub fn due_credential(token: &str, upstream_left: TimeDelta) -> Credential {
        Credential::from_records(vec![record(token, Utc::now() + upstream_left)]).unwrap()
    }
}
