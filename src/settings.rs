use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use ipnet::IpNet;
use regex::Regex;
use tracing::warn;

pub const DEFAULT_SLUG_PATTERN: &str = "^[A-Za-z0-9_-]{3,50}$";

/// Runtime configuration, read once at startup. Every value has a default;
/// an unparseable override logs a warning and keeps the default.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub debug: bool,

    pub public_base_url: Option<String>,
    pub media_url: String,
    pub media_root: PathBuf,
    pub media_url_ttl: i64,
    pub media_signing_key: Vec<u8>,

    pub message_max_length: usize,
    pub rate_limit: i64,
    pub rate_window: i64,
    pub page_size: i64,
    pub max_page_size: i64,
    pub username_max_length: usize,

    pub slug_pattern_source: String,
    slug_pattern: Option<Regex>,

    pub trusted_proxies: Vec<IpNet>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            database_url: "sqlite:backchat.db".to_owned(),
            debug: false,
            public_base_url: None,
            media_url: "/media/".to_owned(),
            media_root: PathBuf::from("media"),
            media_url_ttl: 300,
            media_signing_key: Vec::new(),
            message_max_length: 1000,
            rate_limit: 10,
            rate_window: 30,
            page_size: 50,
            max_page_size: 200,
            username_max_length: 30,
            slug_pattern_source: DEFAULT_SLUG_PATTERN.to_owned(),
            slug_pattern: compile_slug_pattern(DEFAULT_SLUG_PATTERN),
            trusted_proxies: Vec::new(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let slug_pattern_source =
            env_string("CHAT_ROOM_SLUG_REGEX").unwrap_or(defaults.slug_pattern_source);
        let slug_pattern = compile_slug_pattern(&slug_pattern_source);

        Self {
            bind_addr: env_parse("BIND_ADDR", defaults.bind_addr),
            database_url: env_string("DATABASE_URL").unwrap_or(defaults.database_url),
            debug: env_parse("DEBUG", defaults.debug),
            public_base_url: env_string("PUBLIC_BASE_URL"),
            media_url: normalize_media_url(
                &env_string("MEDIA_URL").unwrap_or(defaults.media_url),
            ),
            media_root: env_string("MEDIA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.media_root),
            media_url_ttl: env_parse("MEDIA_URL_TTL_SECONDS", defaults.media_url_ttl),
            media_signing_key: signing_key_from_env(),
            message_max_length: env_parse("CHAT_MESSAGE_MAX_LENGTH", defaults.message_max_length),
            rate_limit: env_parse("CHAT_MESSAGE_RATE_LIMIT", defaults.rate_limit),
            rate_window: env_parse("CHAT_MESSAGE_RATE_WINDOW", defaults.rate_window),
            page_size: env_parse("CHAT_MESSAGES_PAGE_SIZE", defaults.page_size),
            max_page_size: env_parse("CHAT_MESSAGES_MAX_PAGE_SIZE", defaults.max_page_size),
            username_max_length: env_parse("USERNAME_MAX_LENGTH", defaults.username_max_length),
            slug_pattern_source,
            slug_pattern,
            trusted_proxies: parse_proxy_ranges(
                &env_string("TRUSTED_PROXY_RANGES").unwrap_or_default(),
            ),
        }
    }

    /// A slug is acceptable only when the configured pattern matches it.
    /// An uncompilable pattern rejects every slug rather than opening up.
    pub fn is_valid_slug(&self, slug: &str) -> bool {
        match &self.slug_pattern {
            Some(pattern) => pattern.is_match(slug),
            None => false,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    dotenv::var(key).ok().filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env_string(key) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "unparseable setting, keeping default");
                default
            }
        },
        None => default,
    }
}

fn signing_key_from_env() -> Vec<u8> {
    match env_string("MEDIA_SIGNING_KEY") {
        Some(key) => key.into_bytes(),
        None => {
            warn!("MEDIA_SIGNING_KEY unset, signed media URLs will not survive a restart");
            use rand::Rng;
            let key: [u8; 32] = rand::rng().random();
            key.to_vec()
        }
    }
}

fn compile_slug_pattern(source: &str) -> Option<Regex> {
    match Regex::new(source) {
        Ok(pattern) => Some(pattern),
        Err(err) => {
            warn!(pattern = source, %err, "invalid room slug pattern, rejecting all slugs");
            None
        }
    }
}

/// Media URLs always carry a leading and trailing slash so path arithmetic
/// elsewhere can rely on the shape.
fn normalize_media_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/media/".to_owned()
    } else {
        format!("/{trimmed}/")
    }
}

fn parse_proxy_ranges(raw: &str) -> Vec<IpNet> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| {
            match part
                .parse::<IpNet>()
                .or_else(|_| part.parse::<IpAddr>().map(IpNet::from))
            {
                Ok(net) => Some(net),
                Err(_) => {
                    warn!(range = part, "ignoring unparseable trusted proxy range");
                    None
                }
            }
        })
        .collect()
}
