use std::sync::Arc;

use axum::{
    Json, Router, debug_handler,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::AppError;
use crate::AppState;
use crate::access::{self, RoomKind};
use crate::media::url::{ConnectionHints, public_media_url};
use crate::session::Identity;
use crate::settings::Settings;
use crate::store::{ChatStore, PUBLIC_ROOM_SLUG, Room, RoomClaim, sqlite::SqliteStore};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms/{slug}", get(room_details))
        .route("/rooms/{slug}/messages", get(room_messages))
}

/// Idempotent claim: visiting a room slug either finds it or founds it. A
/// fresh room is private and owned by the visitor; somebody else's room is a
/// conflict. DIRECT rooms are never claimed, they only answer to their two
/// participants. Storage trouble degrades to an optimistic answer instead of
/// an error page.
#[debug_handler(state = crate::AppState)]
async fn room_details(
    Path(slug): Path<String>,
    State(settings): State<Arc<Settings>>,
    State(store): State<SqliteStore>,
    identity: Identity,
) -> Response {
    if !settings.is_valid_slug(&slug) {
        return bad_request("invalid_room_slug");
    }

    if slug == PUBLIC_ROOM_SLUG {
        return match store.ensure_public_room().await {
            Ok(room) => room_json(&room, false),
            Err(err) => degraded_room(&slug, RoomKind::Public, err),
        };
    }

    let Some(username) = identity.username.clone() else {
        return unauthorized();
    };

    match store.claim_room(&slug, &username).await {
        Ok(RoomClaim::Created(room)) => room_json(&room, true),
        Ok(RoomClaim::Existing(room)) => {
            if room.kind == RoomKind::Direct && !readable_by(&store, &room, &identity).await {
                return StatusCode::NOT_FOUND.into_response();
            }
            room_json(&room, false)
        }
        Ok(RoomClaim::OwnedByOther(_)) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "room_taken" })),
        )
            .into_response(),
        Err(err) => degraded_room(&slug, RoomKind::Private, err),
    }
}

#[derive(Deserialize)]
struct MessagesQuery {
    limit: Option<String>,
    before: Option<String>,
}

/// Backwards-walking history. `before` is an exclusive id cursor; pages come
/// back ascending so clients can prepend them as they scroll up.
#[debug_handler(state = crate::AppState)]
async fn room_messages(
    Path(slug): Path<String>,
    Query(query): Query<MessagesQuery>,
    State(settings): State<Arc<Settings>>,
    State(store): State<SqliteStore>,
    identity: Identity,
    headers: HeaderMap,
) -> Response {
    if !settings.is_valid_slug(&slug) {
        return bad_request("invalid_room_slug");
    }

    let limit = match query.limit.as_deref() {
        Some(raw) => match parse_positive(raw) {
            Some(limit) => limit,
            None => return bad_request("invalid_limit"),
        },
        None => settings.page_size,
    };
    let limit = limit.min(settings.max_page_size);

    let before = match query.before.as_deref() {
        Some(raw) => match parse_positive(raw) {
            Some(before) => Some(before),
            None => return bad_request("invalid_before"),
        },
        None => None,
    };

    if !identity.is_authenticated() && slug != PUBLIC_ROOM_SLUG {
        return unauthorized();
    }

    match store.room_by_slug(&slug).await {
        Ok(Some(room)) => {
            if !readable_by(&store, &room, &identity).await {
                return StatusCode::NOT_FOUND.into_response();
            }
        }
        Ok(None) => {}
        Err(err) => return degraded_page(limit, err),
    }

    let page = match store.messages_before(&slug, before, limit).await {
        Ok(page) => page,
        Err(err) => return degraded_page(limit, err),
    };

    let hints = ConnectionHints::from_parts(&headers, Some(settings.bind_addr), false);
    let messages: Vec<_> = page
        .messages
        .iter()
        .map(|record| {
            json!({
                "id": record.id,
                "room": record.room,
                "username": record.username,
                "message": record.message,
                "profilePic": public_media_url(&settings, &hints, record.profile_pic.as_deref()),
                "createdAt": record.created_at,
            })
        })
        .collect();
    let next_before = page.messages.first().map(|record| record.id);

    Json(json!({
        "messages": messages,
        "pagination": {
            "limit": limit,
            "hasMore": page.has_more,
            "nextBefore": next_before,
        },
    }))
    .into_response()
}

async fn readable_by(store: &SqliteStore, room: &Room, identity: &Identity) -> bool {
    let role = match identity.username.as_deref() {
        Some(username) => match store.role_for(room.id, username).await {
            Ok(role) => role,
            Err(err) => {
                warn!(room = %room.slug, error = %err.0, "role lookup failed");
                None
            }
        },
        None => None,
    };
    access::can_read(
        room.kind,
        room.direct_pair_key.as_deref(),
        role,
        identity.username.as_deref(),
    )
}

fn parse_positive(raw: &str) -> Option<i64> {
    raw.parse::<i64>().ok().filter(|n| *n > 0)
}

fn room_json(room: &Room, created: bool) -> Response {
    Json(json!({
        "slug": room.slug,
        "name": room.name,
        "kind": room.kind.as_str(),
        "created": created,
        "createdBy": room.created_by,
    }))
    .into_response()
}

pub(super) fn bad_request(reason: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))).into_response()
}

pub(super) fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "authentication_required" })),
    )
        .into_response()
}

fn degraded_room(slug: &str, kind: RoomKind, err: AppError) -> Response {
    warn!(room = slug, error = %err.0, "room claim degraded");
    Json(json!({
        "slug": slug,
        "name": slug,
        "kind": kind.as_str(),
        "created": true,
        "createdBy": null,
    }))
    .into_response()
}

fn degraded_page(limit: i64, err: AppError) -> Response {
    warn!(error = %err.0, "message history degraded");
    Json(json!({
        "messages": [],
        "pagination": { "limit": limit, "hasMore": false, "nextBefore": null },
    }))
    .into_response()
}
