//! AWS-backed authorization source and account discovery.

use anyhow::{Context, Result};
use aws_config::SdkConfig;
use chrono::DateTime;
use tracing::{debug, instrument};

use super::source::{AuthorizationRecord, AuthorizationSource, FetchError};

/// Load the shared AWS SDK configuration for `region` from the environment
/// (credentials chain, profile, IMDS).
pub async fn load_sdk_config(region: &str) -> SdkConfig {
    aws_config::from_env()
        .region(aws_config::Region::new(region.to_owned()))
        .load()
        .await
}

/// Look up the account id of the calling identity via STS.
pub async fn resolve_account_id(sdk_config: &SdkConfig) -> Result<String> {
    let client = aws_sdk_sts::Client::new(sdk_config);
    let identity = client
        .get_caller_identity()
        .send()
        .await
        .context("STS GetCallerIdentity failed")?;
    identity
        .account()
        .map(str::to_owned)
        .context("STS GetCallerIdentity returned no account")
}

/// [`AuthorizationSource`] calling ECR `GetAuthorizationToken`.
pub struct EcrAuthorizationSource {
    client: aws_sdk_ecr::Client,
    account_id: String,
}

impl EcrAuthorizationSource {
    pub fn new(sdk_config: &SdkConfig, account_id: impl Into<String>) -> Self {
        Self {
            client: aws_sdk_ecr::Client::new(sdk_config),
            account_id: account_id.into(),
        }
    }
}

#[async_trait::async_trait]
impl AuthorizationSource for EcrAuthorizationSource {
    #[instrument(skip(self), fields(account_id = %self.account_id))]
    async fn fetch_authorization(&self) -> Result<Vec<AuthorizationRecord>, FetchError> {
        #[allow(deprecated)]
        let output = self
            .client
            .get_authorization_token()
            .registry_ids(&self.account_id)
            .send()
            .await
            .map_err(|e| {
                FetchError::Upstream(aws_sdk_ecr::error::DisplayErrorContext(&e).to_string())
            })?;

        let records: Vec<AuthorizationRecord> = output
            .authorization_data()
            .iter()
            .map(|data| AuthorizationRecord {
                token: data.authorization_token().map(str::to_owned),
                expires_at: data
                    .expires_at()
                    .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
                proxy_endpoint: data.proxy_endpoint().map(str::to_owned),
            })
            .collect();

        debug!(count = records.len(), "ECR authorization data received");
        Ok(records)
    }
}
