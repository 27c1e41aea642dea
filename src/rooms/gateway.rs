//! Per-connection chat state machine. The WebSocket handler in `ws` stays a
//! thin driver; everything the protocol means lives here, where it can be
//! exercised without a socket.

use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::access;
use crate::broadcast::RoomGroups;
use crate::media::url::{ConnectionHints, public_media_url};
use crate::ratelimit::{RateLimiter, RatePolicy};
use crate::session::Identity;
use crate::settings::Settings;
use crate::store::{ChatStore, PUBLIC_ROOM_SLUG, Room};

/// Application close code for connections that fail authorization.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;

pub const ERR_MESSAGE_TOO_LONG: &str = "message_too_long";
pub const ERR_RATE_LIMITED: &str = "rate_limited";

const GROUP_PREFIX: &str = "chat_";
const GROUP_MAX_LEN: usize = 80;

/// Why a connection attempt was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Refusal {
    /// The requested slug fails the configured pattern; refused before the
    /// upgrade completes.
    #[error("invalid room slug")]
    InvalidSlug,
    /// The caller may not read this room; the socket opens just long enough
    /// to carry the close code.
    #[error("unauthorized")]
    Unauthorized,
}

/// What handling one inbound frame produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Dropped without a reply: malformed, empty, or from a sender who may
    /// not post here.
    Ignored,
    /// Understood but refused; only the sender hears about it.
    Rejected(&'static str),
    /// Persisted and published to the room group.
    Delivered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Open,
    Closed,
}

#[derive(Deserialize)]
struct InboundFrame {
    message: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    room: Option<String>,
}

/// One live chat connection. Constructed only by passing the handshake
/// checks, so holding a value means the caller was admitted.
#[derive(Debug)]
pub struct ChatConnection {
    slug: String,
    group: String,
    identity: Identity,
    writable: bool,
    hints: ConnectionHints,
    state: ConnState,
}

impl ChatConnection {
    /// Handshake: validate the slug, resolve the room, authorize the caller.
    /// The room row and role are read once; the write decision is cached for
    /// the connection's lifetime.
    pub async fn connect<S: ChatStore>(
        store: &S,
        settings: &Settings,
        identity: Identity,
        slug: &str,
        hints: ConnectionHints,
    ) -> Result<Self, Refusal> {
        if !settings.is_valid_slug(slug) {
            return Err(Refusal::InvalidSlug);
        }

        let room = resolve_room(store, slug).await;
        let (readable, writable) = match &room {
            Some(room) => {
                let role = role_of(store, room, &identity).await;
                (
                    access::can_read(
                        room.kind,
                        room.direct_pair_key.as_deref(),
                        role,
                        identity.username.as_deref(),
                    ),
                    access::can_write(
                        room.kind,
                        room.direct_pair_key.as_deref(),
                        role,
                        identity.username.as_deref(),
                    ),
                )
            }
            // No stored room: guests only get the public slug, signed-in
            // callers pass and may post since no role can deny them yet.
            None => {
                let authed = identity.is_authenticated();
                (authed || slug == PUBLIC_ROOM_SLUG, authed)
            }
        };

        if !readable {
            return Err(Refusal::Unauthorized);
        }

        Ok(Self {
            slug: slug.to_owned(),
            group: group_name(slug),
            identity,
            writable,
            hints,
            state: ConnState::Open,
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Run one inbound frame through the full pipeline: parse, authorize,
    /// bound, throttle, persist, publish. Failures never kill the
    /// connection; they either reply to the sender or vanish.
    pub async fn on_frame<S: ChatStore>(
        &self,
        store: &S,
        settings: &Settings,
        limiter: &RateLimiter,
        groups: &RoomGroups,
        raw: &[u8],
    ) -> FrameOutcome {
        if self.state != ConnState::Open {
            return FrameOutcome::Ignored;
        }

        let Ok(frame) = serde_json::from_slice::<InboundFrame>(raw) else {
            return FrameOutcome::Ignored;
        };
        let message = frame.message.trim();
        if message.is_empty() {
            return FrameOutcome::Ignored;
        }

        let Some(sender) = self.identity.username.as_deref() else {
            return FrameOutcome::Ignored;
        };
        if !self.writable {
            return FrameOutcome::Ignored;
        }

        if message.chars().count() > settings.message_max_length {
            return FrameOutcome::Rejected(ERR_MESSAGE_TOO_LONG);
        }

        let scope = format!("rl:chat:message:{sender}");
        let policy = RatePolicy {
            limit: settings.rate_limit,
            window_seconds: settings.rate_window,
        };
        if limiter.is_limited(&scope, policy).await {
            return FrameOutcome::Rejected(ERR_RATE_LIMITED);
        }

        let username = frame.username.as_deref().unwrap_or(sender);
        let room = frame.room.as_deref().unwrap_or(&self.slug);

        let image = match store.profile_image(sender).await {
            Ok(image) => image,
            Err(err) => {
                warn!(user = sender, error = %err.0, "profile lookup failed");
                None
            }
        };

        if let Err(err) = store
            .insert_message(room, username, Some(sender), message, image.as_deref())
            .await
        {
            warn!(room, error = %err.0, "message persist failed, dropping broadcast");
            return FrameOutcome::Ignored;
        }

        let event = json!({
            "message": message,
            "username": username,
            "profilePic": public_media_url(settings, &self.hints, image.as_deref()),
            "room": room,
        })
        .to_string();
        groups.send(&self.group, event);
        FrameOutcome::Delivered
    }

    /// Tear down. The caller drops its group receiver first so the group can
    /// be pruned.
    pub fn close(&mut self, groups: &RoomGroups) {
        if self.state == ConnState::Open {
            self.state = ConnState::Closed;
            groups.leave(&self.group);
        }
    }
}

pub fn error_frame(reason: &str) -> String {
    json!({ "error": reason }).to_string()
}

async fn resolve_room<S: ChatStore>(store: &S, slug: &str) -> Option<Room> {
    if slug == PUBLIC_ROOM_SLUG {
        match store.ensure_public_room().await {
            Ok(room) => Some(room),
            Err(err) => {
                warn!(error = %err.0, "public room ensure failed, applying open-room rules");
                None
            }
        }
    } else {
        match store.room_by_slug(slug).await {
            Ok(room) => room,
            Err(err) => {
                warn!(room = slug, error = %err.0, "room lookup failed, applying open-room rules");
                None
            }
        }
    }
}

async fn role_of<S: ChatStore>(
    store: &S,
    room: &Room,
    identity: &Identity,
) -> Option<access::Role> {
    let username = identity.username.as_deref()?;
    match store.role_for(room.id, username).await {
        Ok(role) => role,
        Err(err) => {
            warn!(room = %room.slug, user = username, error = %err.0, "role lookup failed");
            None
        }
    }
}

/// Stable broadcast-group identifier for a room name: lowercased and reduced
/// to `[a-z0-9_-]`, with a content hash standing in when nothing survives.
/// Always non-empty, ASCII, and at most 80 bytes including the prefix.
pub fn group_name(name: &str) -> String {
    let normalized = slugify(name);
    let mut group = if normalized.is_empty() {
        format!("{GROUP_PREFIX}{}", hex_digest(name))
    } else {
        format!("{GROUP_PREFIX}{normalized}")
    };
    group.truncate(GROUP_MAX_LEN);
    group
}

fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_whitespace() || c == '-' {
            if !out.is_empty() && !out.ends_with('-') {
                out.push('-');
            }
        } else if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c.to_ascii_lowercase());
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

fn hex_digest(name: &str) -> String {
    use std::fmt::Write;
    Sha256::digest(name.as_bytes())
        .iter()
        .fold(String::with_capacity(64), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
}
