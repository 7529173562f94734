use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub aws: AwsConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub credentials: CredentialConfig,
}

// ---------------------------------------------------------------------------
// AWS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    /// Region of the ECR registry (e.g. `us-east-1`).
    #[serde(default = "default_region")]
    pub region: String,
    /// Registry (account) id.  When unset the id of the calling identity is
    /// looked up through STS at startup.
    #[serde(default)]
    pub account_id: Option<String>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            account_id: None,
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

// ---------------------------------------------------------------------------
// Proxy listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// HTTPS listen port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long (seconds) in-flight connections may drain after a shutdown
    /// signal.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_port() -> u16 {
    5000
}

fn default_shutdown_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// TLS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain.  Generated (self-signed) when missing.
    #[serde(default = "default_cert_file")]
    pub cert_file: String,
    /// PEM private key.
    #[serde(default = "default_key_file")]
    pub key_file: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_file: default_cert_file(),
            key_file: default_key_file(),
        }
    }
}

fn default_cert_file() -> String {
    "./certs/tls.crt".to_string()
}

fn default_key_file() -> String {
    "./certs/tls.key".to_string()
}

// ---------------------------------------------------------------------------
// Access control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessConfig {
    /// Comma-separated IPs / CIDR blocks admitted to the registry path.
    /// Empty disables the gate entirely.
    #[serde(default)]
    pub ip_whitelist: String,
}

impl AccessConfig {
    pub fn is_enabled(&self) -> bool {
        !self.ip_whitelist.trim().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Credential refresh
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
    /// Interval (seconds) between background credential refreshes.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

fn default_refresh_interval() -> u64 {
    6 * 60 * 60
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load a [`Config`] from an optional YAML file, apply the process
/// environment on top, and validate the result.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&contents)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        }
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate_config(&config)?;
    Ok(config)
}

/// Overlay the deployment environment variables onto `config`.
///
/// `lookup` abstracts `std::env::var` so tests do not touch process state.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(region) = lookup("AWS_REGION").filter(|v| !v.is_empty()) {
        config.aws.region = region;
    }
    if let Some(account) = lookup("AWS_ACCOUNT_ID").filter(|v| !v.is_empty()) {
        config.aws.account_id = Some(account);
    }
    if let Some(whitelist) = lookup("IP_WHITELIST") {
        config.access.ip_whitelist = whitelist;
    }
    if let Some(cert) = lookup("TLS_CERT_FILE").filter(|v| !v.is_empty()) {
        config.tls.cert_file = cert;
    }
    if let Some(key) = lookup("TLS_KEY_FILE").filter(|v| !v.is_empty()) {
        config.tls.key_file = key;
    }
    if let Some(port) = lookup("PORT").filter(|v| !v.is_empty()) {
        config.proxy.port = port
            .trim()
            .parse()
            .with_context(|| format!("invalid port number: {port}"))?;
    }
    Ok(())
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.proxy.port != 0,
        "invalid port number: {}",
        config.proxy.port
    );
    anyhow::ensure!(!config.aws.region.trim().is_empty(), "aws.region must be set");
    anyhow::ensure!(
        config.credentials.refresh_interval_secs > 0,
        "credentials.refresh_interval_secs must be positive"
    );
    anyhow::ensure!(
        !config.tls.cert_file.is_empty() && !config.tls.key_file.is_empty(),
        "tls.cert_file and tls.key_file must be set"
    );
    Ok(())
}
