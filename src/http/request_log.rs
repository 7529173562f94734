use std::net::{IpAddr, SocketAddr};

use axum::http::{HeaderMap, Method};
use tracing::info;

/// Client address as reported in request logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedClient {
    pub ip: String,
    pub port: u16,
}

/// Resolve the client for logging.
///
/// Prefers a valid first `X-Forwarded-For` entry, then a valid `X-Real-IP`,
/// then the transport address.  The port always comes from the transport.
/// Access decisions never use this.
pub fn logged_client(headers: &HeaderMap, remote: SocketAddr) -> LoggedClient {
    let forwarded = header_ip(headers, "x-forwarded-for", |v| v.split(',').next());
    let real_ip = || header_ip(headers, "x-real-ip", Some);

    let ip = forwarded
        .or_else(real_ip)
        .unwrap_or_else(|| remote.ip())
        .to_string();

    LoggedClient {
        ip,
        port: remote.port(),
    }
}

fn header_ip<'a>(
    headers: &'a HeaderMap,
    name: &str,
    pick: impl Fn(&'a str) -> Option<&'a str>,
) -> Option<IpAddr> {
    let value = headers.get(name)?.to_str().ok()?;
    pick(value)?.trim().parse().ok()
}

/// Escape CR and LF so one request can never produce two log lines.
pub fn sanitize(msg: &str) -> String {
    msg.replace('\n', "\\n").replace('\r', "\\r")
}

pub fn log_request(
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    remote: SocketAddr,
    msg: &str,
) {
    let client = logged_client(headers, remote);
    info!(
        method = %method,
        ip = %client.ip,
        port = client.port,
        path = %sanitize(path),
        "{}",
        sanitize(msg)
    );
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn remote() -> SocketAddr {
        "192.0.2.7:40000".parse().unwrap()
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn falls_back_to_transport_address() {
        let client = logged_client(&HeaderMap::new(), remote());
        assert_eq!(client, LoggedClient { ip: "192.0.2.7".into(), port: 40000 });
    }

    #[test]
    fn first_forwarded_for_entry_wins() {
        let h = headers(&[
            ("x-forwarded-for", " 203.0.113.5 , 10.0.0.1"),
            ("x-real-ip", "198.51.100.1"),
        ]);
        let client = logged_client(&h, remote());
        assert_eq!(client.ip, "203.0.113.5");
        assert_eq!(client.port, 40000);
    }

    #[test]
    fn invalid_forwarded_for_falls_through_to_real_ip() {
        let h = headers(&[("x-forwarded-for", "garbage, 10.0.0.1"), ("x-real-ip", "2001:db8::9")]);
        assert_eq!(logged_client(&h, remote()).ip, "2001:db8::9");
    }

    #[test]
    fn invalid_headers_fall_through_to_transport() {
        let h = headers(&[("x-forwarded-for", "unknown"), ("x-real-ip", "nope")]);
        assert_eq!(logged_client(&h, remote()).ip, "192.0.2.7");
    }

    #[test]
    fn ipv6_transport_address_has_no_brackets() {
        let client = logged_client(&HeaderMap::new(), "[2001:db8::1]:443".parse().unwrap());
        assert_eq!(client.ip, "2001:db8::1");
        assert_eq!(client.port, 443);
    }

    #[test]
    fn sanitize_escapes_line_breaks() {
        assert_eq!(sanitize("a\nb\r\nc"), "a\\nb\\r\\nc");
        assert_eq!(sanitize("plain"), "plain");
    }
}
