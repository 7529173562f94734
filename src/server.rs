//! HTTPS server: TLS accept loop feeding the axum router.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn};

/// Serve `app` over TLS until `shutdown` fires, then drain open connections
/// for at most `grace`.
pub async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    shutdown: CancellationToken,
    grace: Duration,
) -> Result<()> {
    let graceful = GracefulShutdown::new();

    loop {
        let (stream, remote_addr) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        let watcher = graceful.watcher();
        tokio::spawn(async move {
            serve_connection(stream, remote_addr, acceptor, app, watcher).await;
        });
    }

    drop(listener);
    info!("no longer accepting connections, draining");

    tokio::select! {
        () = graceful.shutdown() => info!("all connections closed"),
        () = tokio::time::sleep(grace) => {
            warn!(grace_secs = grace.as_secs(), "shutdown grace period elapsed, dropping open connections");
        }
    }
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    acceptor: TlsAcceptor,
    app: Router,
    watcher: hyper_util::server::graceful::Watcher,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, %remote_addr, "TLS handshake failed");
            return;
        }
    };

    let service = service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(ConnectInfo(remote_addr));
        app.clone().oneshot(req)
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(tls_stream), service);
    if let Err(e) = watcher.watch(conn).await {
        debug!(error = %e, %remote_addr, "connection error");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::StatusCode;

    use super::*;
    use crate::auth::allowlist::AllowList;
    use crate::config::TlsConfig;
    use crate::credentials::manager::testing::FakeSource;
    use crate::credentials::CredentialManager;
    use crate::http::forward::build_client;
    use crate::http::handler::create_router;
    use crate::metrics::MetricsRegistry;
    use crate::tls::{build_acceptor, ensure_certificates};
    use crate::AppState;

    struct Running {
        addr: SocketAddr,
        shutdown: CancellationToken,
        handle: tokio::task::JoinHandle<Result<()>>,
        _dir: tempfile::TempDir,
    }

    async fn start(allow: Option<&str>) -> Running {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let dir = tempfile::tempdir().unwrap();
        let tls = TlsConfig {
            cert_file: dir.path().join("tls.crt").to_string_lossy().into_owned(),
            key_file: dir.path().join("tls.key").to_string_lossy().into_owned(),
        };
        ensure_certificates(&tls).unwrap();
        let acceptor = build_acceptor(&tls).unwrap();

        let state = Arc::new(AppState {
            credentials: Arc::new(CredentialManager::new(FakeSource::new()).await.unwrap()),
            allow_list: allow.map(|allow_list| Arc::new(AllowList::parse(allow_list))),
            http_client: build_client().unwrap(),
            metrics: MetricsRegistry::new(),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(serve_tls(
            listener,
            acceptor,
            create_router(state),
            shutdown.clone(),
            Duration::from_secs(5),
        ));

        Running {
            addr,
            shutdown,
            handle,
            _dir: dir,
        }
    }

    fn insecure_client() -> reqwest::Client {
        reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn serves_health_over_tls_and_shuts_down() {
        let server = start(None).await;

        let response = insecure_client()
            .get(format!("https://{}/healthz", server.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        server.shutdown.cancel();
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn peer_address_reaches_the_access_gate() {
        let server = start(Some("192.0.2.0/24")).await;

        let response = insecure_client()
            .get(format!("https://{}/v2/", server.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        server.shutdown.cancel();
        server.handle.await.unwrap().unwrap();
    }
}
