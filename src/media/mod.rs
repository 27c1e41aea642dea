pub mod url;

use std::sync::Arc;

use axum::{
    Json, Router, debug_handler,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use time::OffsetDateTime;
use tracing::debug;

use crate::AppState;
use crate::settings::Settings;
use url::normalize_media_path;

type HmacSha256 = Hmac<Sha256>;

pub fn router() -> Router<AppState> {
    Router::new().route("/media/{*path}", get(serve_media))
}

/// Mint a time-boxed URL for a stored media path.
pub fn signed_media_url(settings: &Settings, path: &str) -> String {
    let exp = OffsetDateTime::now_utc().unix_timestamp() + settings.media_url_ttl;
    let sig = sign(&settings.media_signing_key, path, exp);
    format!("{}{}?exp={}&sig={}", settings.media_url, path, exp, sig)
}

pub fn sign(key: &[u8], path: &str, exp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(path.as_bytes());
    mac.update(b":");
    mac.update(exp.to_string().as_bytes());
    hex_encode(&mac.finalize().into_bytes())
}

pub fn verify_signature(key: &[u8], path: &str, exp: i64, sig: &str) -> bool {
    let Some(sig) = hex_decode(sig) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(path.as_bytes());
    mac.update(b":");
    mac.update(exp.to_string().as_bytes());
    mac.verify_slice(&sig).is_ok()
}

#[derive(Deserialize)]
struct MediaQuery {
    exp: Option<String>,
    sig: Option<String>,
}

#[debug_handler(state = crate::AppState)]
async fn serve_media(
    Path(path): Path<String>,
    State(settings): State<Arc<Settings>>,
    Query(query): Query<MediaQuery>,
) -> Response {
    let Some(rel) = normalize_media_path(&path, &settings.media_url) else {
        return not_found();
    };

    let mut max_age = settings.media_url_ttl;
    if !settings.debug {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let exp = match query.exp.as_deref().and_then(|raw| raw.parse::<i64>().ok()) {
            Some(exp) => exp,
            None => return forbidden("missing_or_invalid_exp"),
        };
        if now > exp {
            return forbidden("expired");
        }
        let Some(sig) = query.sig.as_deref() else {
            return forbidden("missing_signature");
        };
        if !verify_signature(&settings.media_signing_key, &rel, exp, sig) {
            return forbidden("invalid_signature");
        }
        max_age = exp - now;
    }

    let full = settings.media_root.join(&rel);
    let body = match tokio::fs::read(&full).await {
        Ok(body) => body,
        Err(err) => {
            debug!(path = %rel, %err, "media file unavailable");
            return not_found();
        }
    };

    let content_type = mime_guess::from_path(&full).first_or_octet_stream();
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CACHE_CONTROL, format!("private, max-age={max_age}")),
        ],
        body,
    )
        .into_response()
}

fn forbidden(reason: &str) -> Response {
    (StatusCode::FORBIDDEN, Json(json!({ "error": reason }))).into_response()
}

fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn hex_decode(raw: &str) -> Option<Vec<u8>> {
    if !raw.is_ascii() || raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"test-signing-key";

    #[test]
    fn signatures_verify_and_tampering_fails() {
        let sig = sign(KEY, "profile_pics/a.jpg", 1_700_000_000);
        assert!(verify_signature(KEY, "profile_pics/a.jpg", 1_700_000_000, &sig));
        assert!(!verify_signature(KEY, "profile_pics/b.jpg", 1_700_000_000, &sig));
        assert!(!verify_signature(KEY, "profile_pics/a.jpg", 1_700_000_001, &sig));
        assert!(!verify_signature(b"other-key", "profile_pics/a.jpg", 1_700_000_000, &sig));
    }

    #[test]
    fn malformed_signatures_are_rejected_outright() {
        assert!(!verify_signature(KEY, "a.jpg", 1, "not-hex"));
        assert!(!verify_signature(KEY, "a.jpg", 1, "abc"));
        assert!(!verify_signature(KEY, "a.jpg", 1, ""));
    }

    #[test]
    fn minted_urls_carry_expiry_and_signature() {
        let mut settings = Settings::default();
        settings.media_signing_key = KEY.to_vec();
        let url = signed_media_url(&settings, "profile_pics/a.jpg");
        assert!(url.starts_with("/media/profile_pics/a.jpg?exp="));
        assert!(url.contains("&sig="));
    }

    #[test]
    fn hex_helpers_round_trip() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x1a]), "00ff1a");
        assert_eq!(hex_decode("00ff1a"), Some(vec![0x00, 0xff, 0x1a]));
        assert_eq!(hex_decode("zz"), None);
        assert_eq!(hex_decode("0"), None);
    }
}
