//! IP allow-list matching.
//!
//! The allow-list is a comma-separated set of IPv4/IPv6 addresses and CIDR
//! blocks.  Bad entries are skipped with a warning; an empty list admits
//! nobody.  Client addresses arrive as `host`, `host:port`, `[v6]` or
//! `[v6]:port`, and IPv4-mapped IPv6 addresses match IPv4 entries.

use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net};
use tracing::{debug, warn};

/// A parsed allow-list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    nets: Vec<IpNet>,
}

impl AllowList {
    /// Parse `allow_list`, skipping entries that are empty or not an IP / CIDR.
    pub fn parse(allow_list: &str) -> Self {
        let nets = allow_list
            .split(',')
            .filter_map(|raw| {
                let entry: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
                if entry.is_empty() {
                    return None;
                }
                match parse_entry(&entry) {
                    Some(net) => Some(net),
                    None => {
                        warn!(entry = %entry, "invalid allow-list entry, skipping");
                        None
                    }
                }
            })
            .collect();
        Self { nets }
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    /// Whether the client at `client_address` is admitted.
    pub fn allows(&self, client_address: &str) -> bool {
        if self.nets.is_empty() {
            debug!("empty allow-list, denying");
            return false;
        }
        let Some(ip) = parse_client_ip(client_address) else {
            debug!(client_address, "unparseable client address, denying");
            return false;
        };
        self.nets.iter().any(|net| net.contains(&ip))
    }
}

/// Parse `allow_list` and check `client_address` against it in one go.
///
/// Total: malformed input of any kind yields `false`.
pub fn is_allowed(client_address: &str, allow_list: &str) -> bool {
    if allow_list.trim().is_empty() {
        debug!("empty allow-list, denying");
        return false;
    }
    AllowList::parse(allow_list).allows(client_address)
}

/// A bare address becomes a single-host prefix (/32 or /128).
fn parse_entry(entry: &str) -> Option<IpNet> {
    let net = if entry.contains('/') {
        entry.parse::<IpNet>().ok()?
    } else {
        IpNet::from(entry.parse::<IpAddr>().ok()?)
    };
    Some(fold_ipv4_mapped(net))
}

/// `::ffff:a.b.c.d/n` with `n >= 96` covers only IPv4-mapped addresses, which
/// clients are normalised to, so it becomes `a.b.c.d/(n - 96)`.
fn fold_ipv4_mapped(net: IpNet) -> IpNet {
    let IpNet::V6(v6) = net else {
        return net;
    };
    if v6.prefix_len() < 96 {
        return net;
    }
    v6.addr()
        .to_ipv4_mapped()
        .and_then(|v4| Ipv4Net::new(v4, v6.prefix_len() - 96).ok())
        .map(IpNet::V4)
        .unwrap_or(net)
}

/// Extract and normalise the IP from a transport remote address.
pub fn parse_client_ip(client_address: &str) -> Option<IpAddr> {
    let host = split_host(client_address.trim());
    let ip: IpAddr = host.trim().parse().ok()?;
    Some(normalize(ip))
}

/// Strip an optional port and IPv6 brackets.
///
/// Anything after `]` other than `:port` leaves the address intact, so it
/// fails to parse.
fn split_host(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, "")) => host,
            Some((host, tail))
                if tail
                    .strip_prefix(':')
                    .is_some_and(|port| !port.contains([':', '[', ']'])) =>
            {
                host
            }
            _ => addr,
        };
    }
    match addr.rsplit_once(':') {
        // Exactly one colon: host:port.  More than one is a bare IPv6 address.
        Some((host, _port)) if !host.contains(':') => host,
        _ => addr,
    }
}

fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}
