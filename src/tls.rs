//! TLS termination: self-signed bootstrap and the `rustls` acceptor.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::TlsConfig;

/// Names the generated certificate is valid for.
const SELF_SIGNED_NAMES: [&str; 2] = ["localhost", "127.0.0.1"];

/// Generate a self-signed certificate and key if the certificate file is
/// missing.  Returns whether anything was written.
pub fn ensure_certificates(config: &TlsConfig) -> Result<bool> {
    let cert_file = Path::new(&config.cert_file);
    let key_file = Path::new(&config.key_file);
    if cert_file.exists() {
        return Ok(false);
    }

    info!(
        cert_file = %cert_file.display(),
        "TLS certificate not found, generating self-signed certificate"
    );

    for path in [cert_file, key_file] {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            create_private_dir(dir)?;
        }
    }

    let names = SELF_SIGNED_NAMES.iter().map(|n| n.to_string()).collect::<Vec<_>>();
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(names).context("failed to generate self-signed certificate")?;

    fs::write(cert_file, cert.pem())
        .with_context(|| format!("failed to write {}", cert_file.display()))?;
    write_private(key_file, key_pair.serialize_pem().as_bytes())?;

    warn!("using a self-signed certificate; clients must trust it explicitly");
    Ok(true)
}

/// Build the acceptor from PEM files, advertising `h2` and `http/1.1`.
pub fn build_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = load_certs(Path::new(&config.cert_file))?;
    let key = load_private_key(Path::new(&config.key_file))?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("certificate and private key do not form a valid TLS identity")?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    info!(cert_file = %config.cert_file, "TLS acceptor ready");
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open certificate file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates from {}", path.display()))?;

    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    debug!(count = certs.len(), path = %path.display(), "loaded certificates");
    Ok(certs)
}

/// Read the first PKCS#1, PKCS#8 or SEC1 key in `path`.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open private key file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    loop {
        let item = rustls_pemfile::read_one(&mut reader)
            .with_context(|| format!("failed to parse private key from {}", path.display()))?;
        match item {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(PrivateKeyDer::Sec1(key)),
            Some(_) => continue,
            None => bail!("no private key found in {}", path.display()),
        }
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .with_context(|| format!("failed to create {}", dir.display()))
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}
