//! Public URL resolution for stored media paths. The service usually sits
//! behind one or more reverse proxies, so the externally reachable base has
//! to be reconstructed per connection from whatever evidence survived.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

use crate::net::first_value;
use crate::settings::Settings;

/// Per-connection facts the resolver works from, captured at upgrade time.
#[derive(Debug, Clone, Default)]
pub struct ConnectionHints {
    pub host: Option<String>,
    pub forwarded_host: Option<String>,
    pub forwarded_proto: Option<String>,
    pub origin: Option<String>,
    pub server_addr: Option<SocketAddr>,
    pub secure: bool,
}

impl ConnectionHints {
    pub fn from_parts(headers: &HeaderMap, server_addr: Option<SocketAddr>, secure: bool) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };
        Self {
            host: header("host"),
            forwarded_host: header("x-forwarded-host"),
            forwarded_proto: header("x-forwarded-proto"),
            origin: header("origin"),
            server_addr,
            secure,
        }
    }
}

/// Turn a stored media reference into something a browser can fetch.
///
/// Relative paths (and absolute URLs that point back at an internal host's
/// media tree) are joined onto the best public base we can derive; absolute
/// URLs elsewhere pass through untouched; traversal attempts resolve to
/// nothing at all. With no base in sight the root-relative path is returned
/// so same-host clients keep working.
pub fn public_media_url(
    settings: &Settings,
    hints: &ConnectionHints,
    source: Option<&str>,
) -> Option<String> {
    let source = source?.trim();
    if source.is_empty() {
        return None;
    }

    let media_url = settings.media_url.as_str();
    let rel = match split_absolute(source) {
        Some((host_port, path)) => {
            if is_internal_host(host_only(host_port)) && path.starts_with(media_url) {
                normalize_media_path(path, media_url)?
            } else {
                return Some(source.to_owned());
            }
        }
        None => normalize_media_path(source, media_url)?,
    };

    match pick_base(settings, hints) {
        Some(base) => Some(format!("{base}{media_url}{rel}")),
        None => Some(format!("{media_url}{rel}")),
    }
}

/// Strip the media prefix (or a bare leading slash) and refuse any path that
/// tries to climb out of the media tree.
pub fn normalize_media_path(raw: &str, media_url: &str) -> Option<String> {
    let mut path = raw.trim();
    if let Some(stripped) = path.strip_prefix(media_url) {
        path = stripped;
    } else if let Some(stripped) = path.strip_prefix('/') {
        path = stripped;
    }
    if path.is_empty() {
        return None;
    }
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return None;
    }
    Some(path.to_owned())
}

fn pick_base(settings: &Settings, hints: &ConnectionHints) -> Option<String> {
    if let Some(configured) = settings.public_base_url.as_deref() {
        if let Some(base) = normalize_base_url(configured) {
            return Some(base);
        }
    }

    let transport_scheme = if hints.secure { "https" } else { "http" };
    let forwarded = hints.forwarded_host.as_deref().and_then(|host| {
        let scheme = hints.forwarded_proto.as_deref().unwrap_or(transport_scheme);
        base_from_host(host, scheme)
    });
    let host = hints
        .host
        .clone()
        .or_else(|| hints.server_addr.map(|addr| addr.to_string()))
        .and_then(|host| base_from_host(&host, transport_scheme));
    let origin = hints.origin.as_deref().and_then(normalize_base_url);

    // A proxy that forwarded us an internal name is no use to an external
    // client; a public Origin is the better guess then.
    let primary = forwarded.or(host);
    match (primary, origin) {
        (Some(primary), Some(origin))
            if is_internal_host(host_of_base(&primary)) && !is_internal_host(host_of_base(&origin)) =>
        {
            Some(origin)
        }
        (Some(primary), _) => Some(primary),
        (None, origin) => origin,
    }
}

/// `scheme://host[:port]` out of a full URL, with the path dropped and the
/// scheme normalized. Anything that is not plain web traffic is rejected.
fn normalize_base_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let (scheme, rest) = raw.split_once("://")?;
    let scheme = normalize_scheme(scheme)?;
    let host_port = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    if host_port.is_empty() {
        return None;
    }
    Some(format!("{scheme}://{host_port}"))
}

fn base_from_host(host: &str, scheme: &str) -> Option<String> {
    let host = first_value(host)?;
    let scheme = normalize_scheme(scheme)?;
    Some(format!("{scheme}://{host}"))
}

/// WebSocket schemes collapse onto their HTTP equivalents; anything else is
/// not a base we can hand to a browser.
fn normalize_scheme(raw: &str) -> Option<&'static str> {
    if raw.eq_ignore_ascii_case("http") || raw.eq_ignore_ascii_case("ws") {
        Some("http")
    } else if raw.eq_ignore_ascii_case("https") || raw.eq_ignore_ascii_case("wss") {
        Some("https")
    } else {
        None
    }
}

fn split_absolute(source: &str) -> Option<(&str, &str)> {
    let idx = source.find("://")?;
    let scheme = &source[..idx];
    if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
        return None;
    }
    let rest = &source[idx + 3..];
    Some(match rest.find('/') {
        Some(slash) => rest.split_at(slash),
        None => (rest, ""),
    })
}

fn host_of_base(base: &str) -> &str {
    let rest = base.split_once("://").map(|(_, rest)| rest).unwrap_or(base);
    host_only(rest)
}

fn host_only(host_port: &str) -> &str {
    if let Some(inner) = host_port.strip_prefix('[') {
        return inner.split(']').next().unwrap_or(inner);
    }
    match host_port.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => host_port,
    }
}

/// Addresses a browser outside the deployment cannot reach.
pub fn is_internal_host(host: &str) -> bool {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => {
                v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
            }
            IpAddr::V6(v6) => {
                v6.is_loopback()
                    || v6.is_unspecified()
                    || (v6.segments()[0] & 0xfe00) == 0xfc00
                    || (v6.segments()[0] & 0xffc0) == 0xfe80
            }
        };
    }
    let lower = host.to_ascii_lowercase();
    lower == "localhost"
        || lower.ends_with(".localhost")
        || lower.ends_with(".local")
        || lower.ends_with(".internal")
}
