//! Relays registry requests upstream with `reqwest`.
//!
//! Bodies stream in both directions.  The client never follows redirects:
//! ECR answers blob downloads with a redirect to S3, and that must reach the
//! caller untouched.

use std::net::IpAddr;

use anyhow::{Context, Result};
use axum::body::{Body, HttpBody as _};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::request::Parts;
use axum::http::Method;
use axum::response::Response;
use tracing::debug;

/// Headers meaningful only for a single transport hop.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// A request on its way to the registry.
///
/// Built from the inbound request; the authorizer then points it at the
/// registry and attaches credentials.
#[derive(Debug)]
pub struct OutboundRequest {
    pub method: Method,
    pub scheme: &'static str,
    pub host: String,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Option<Body>,
}

impl OutboundRequest {
    /// Copy method, path, query and end-to-end headers from an inbound
    /// request, and record `client_ip` in `X-Forwarded-For`.
    pub fn from_inbound(parts: &Parts, body: Body, client_ip: IpAddr) -> Self {
        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);
        append_forwarded_for(&mut headers, client_ip);

        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());

        // Nothing to stream for requests that declare an empty body.
        let body = (body.size_hint().exact() != Some(0)).then_some(body);

        Self {
            method: parts.method.clone(),
            scheme: "https",
            host,
            path_and_query,
            headers,
            body,
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.path_and_query)
    }
}

/// HTTP client for registry traffic.  Redirects are handed back to the caller.
pub fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("ecr-proxy/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("failed to build reqwest client")
}

/// Send `request` and relay the upstream response verbatim.
pub async fn forward(client: &reqwest::Client, request: OutboundRequest) -> Result<Response> {
    let url = request.url();
    debug!(method = %request.method, %url, "forwarding to registry");

    let mut builder = client
        .request(request.method, &url)
        .headers(request.headers);
    if let Some(body) = request.body {
        builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    let upstream = builder
        .send()
        .await
        .with_context(|| format!("failed to reach registry at {url}"))?;

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let forwarded_for = HeaderName::from_static("x-forwarded-for");
    let value = match headers.get(&forwarded_for).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.trim().is_empty() => format!("{prior}, {client_ip}"),
        _ => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(forwarded_for, value);
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::http::{Request, StatusCode};
    use axum::routing::{any, get};
    use axum::Router;
    use bytes::Bytes;

    use super::*;

    fn parts(method: Method, uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn copies_method_path_and_query() {
        let parts = parts(
            Method::GET,
            "/v2/app/tags/list?n=10&last=v1",
            &[("host", "proxy.local:5000")],
        );
        let req = OutboundRequest::from_inbound(&parts, Body::empty(), "10.0.0.1".parse().unwrap());
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.host, "proxy.local:5000");
        assert_eq!(req.path_and_query, "/v2/app/tags/list?n=10&last=v1");
        assert_eq!(req.url(), "https://proxy.local:5000/v2/app/tags/list?n=10&last=v1");
    }

    #[test]
    fn empty_body_is_dropped() {
        let parts = parts(Method::GET, "/v2/", &[]);
        let req = OutboundRequest::from_inbound(&parts, Body::empty(), "10.0.0.1".parse().unwrap());
        assert!(req.body.is_none());
    }

    #[test]
    fn non_empty_body_is_kept() {
        let parts = parts(Method::PUT, "/v2/app/manifests/latest", &[]);
        let req = OutboundRequest::from_inbound(
            &parts,
            Body::from("{\"schemaVersion\":2}"),
            "10.0.0.1".parse().unwrap(),
        );
        assert!(req.body.is_some());
    }

    #[test]
    fn hop_by_hop_headers_are_removed() {
        let parts = parts(
            Method::GET,
            "/v2/",
            &[
                ("connection", "keep-alive, x-trace-hop"),
                ("keep-alive", "timeout=5"),
                ("x-trace-hop", "1"),
                ("transfer-encoding", "chunked"),
                ("upgrade", "h2c"),
                ("accept", "application/vnd.oci.image.manifest.v1+json"),
            ],
        );
        let req = OutboundRequest::from_inbound(&parts, Body::empty(), "10.0.0.1".parse().unwrap());
        for gone in ["connection", "keep-alive", "x-trace-hop", "transfer-encoding", "upgrade"] {
            assert!(!req.headers.contains_key(gone), "{gone} should be stripped");
        }
        assert_eq!(
            req.headers.get("accept").unwrap(),
            "application/vnd.oci.image.manifest.v1+json"
        );
    }

    #[test]
    fn forwarded_for_is_appended() {
        let fresh = parts(Method::GET, "/v2/", &[]);
        let req = OutboundRequest::from_inbound(&fresh, Body::empty(), "10.0.0.1".parse().unwrap());
        assert_eq!(req.headers.get("x-forwarded-for").unwrap(), "10.0.0.1");

        let chained = parts(Method::GET, "/v2/", &[("x-forwarded-for", "203.0.113.9")]);
        let req = OutboundRequest::from_inbound(&chained, Body::empty(), "::1".parse().unwrap());
        assert_eq!(req.headers.get("x-forwarded-for").unwrap(), "203.0.113.9, ::1");
    }

    // ── Round trips against a local upstream ─────────────────────────

    async fn spawn_upstream() -> SocketAddr {
        let app = Router::new()
            .route(
                "/v2/app/blobs/{digest}",
                get(|| async {
                    (
                        StatusCode::TEMPORARY_REDIRECT,
                        [(header::LOCATION, "https://bucket.s3.amazonaws.com/blob?sig=abc")],
                    )
                }),
            )
            .route(
                "/v2/echo",
                any(|headers: HeaderMap, body: Bytes| async move {
                    let seen = headers
                        .get(header::AUTHORIZATION)
                        .cloned()
                        .unwrap_or(HeaderValue::from_static("none"));
                    let mut response = Response::new(Body::from(body));
                    response.headers_mut().insert("x-seen-authorization", seen);
                    response
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    fn plain(addr: SocketAddr, method: Method, path: &str, body: Option<Body>) -> OutboundRequest {
        OutboundRequest {
            method,
            scheme: "http",
            host: addr.to_string(),
            path_and_query: path.to_owned(),
            headers: HeaderMap::new(),
            body,
        }
    }

    #[tokio::test]
    async fn redirects_reach_the_caller() {
        let addr = spawn_upstream().await;
        let client = build_client().unwrap();

        let response = forward(&client, plain(addr, Method::GET, "/v2/app/blobs/sha256:abc", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://bucket.s3.amazonaws.com/blob?sig=abc"
        );
    }

    #[tokio::test]
    async fn body_and_headers_are_relayed() {
        let addr = spawn_upstream().await;
        let client = build_client().unwrap();

        let mut request = plain(addr, Method::PUT, "/v2/echo", Some(Body::from("layer-bytes")));
        request
            .headers
            .insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));

        let response = forward(&client, request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-seen-authorization").unwrap(), "Basic abc");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"layer-bytes");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = build_client().unwrap();
        let err = forward(&client, plain(addr, Method::GET, "/v2/", None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to reach registry"));
    }
}
