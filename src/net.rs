use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use ipnet::IpNet;

/// Resolve the real client address. Forwarding headers are honored only when
/// the immediate peer sits inside a trusted proxy range; otherwise they are
/// attacker-controlled and the socket address wins.
pub fn client_ip(remote: SocketAddr, headers: &HeaderMap, trusted: &[IpNet]) -> IpAddr {
    let remote_ip = remote.ip();
    if !trusted.iter().any(|net| net.contains(&remote_ip)) {
        return remote_ip;
    }
    if let Some(ip) = header_ip(headers, "cf-connecting-ip") {
        return ip;
    }
    if let Some(ip) = header_ip(headers, "x-forwarded-for") {
        return ip;
    }
    remote_ip
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    let raw = headers.get(name)?.to_str().ok()?;
    first_value(raw)?.parse().ok()
}

/// First element of a comma separated header value.
pub fn first_value(raw: &str) -> Option<&str> {
    let first = raw.split(',').next()?.trim();
    if first.is_empty() { None } else { Some(first) }
}
