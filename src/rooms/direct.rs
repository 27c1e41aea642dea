use std::sync::Arc;

use axum::{
    Json, Router, debug_handler,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::AppError;
use crate::AppState;
use crate::access;
use crate::media::url::{ConnectionHints, public_media_url};
use crate::rooms::api::{bad_request, unauthorized};
use crate::session::Identity;
use crate::settings::Settings;
use crate::store::{ChatStore, direct_room_slug, sqlite::SqliteStore};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/direct/start", post(direct_start))
        .route("/direct/chats", get(direct_chats))
}

#[derive(Deserialize)]
struct StartRequest {
    username: Option<String>,
}

/// Opens the one DIRECT room a pair of users shares, founding it on first
/// contact. The slug is derived from the pair, so starting twice lands in
/// the same room; storage trouble degrades to the derived slug.
#[debug_handler(state = crate::AppState)]
async fn direct_start(
    State(settings): State<Arc<Settings>>,
    State(store): State<SqliteStore>,
    identity: Identity,
    headers: HeaderMap,
    Json(request): Json<StartRequest>,
) -> Response {
    let Some(caller) = identity.username else {
        return unauthorized();
    };

    let peer = request
        .username
        .map(|name| name.trim().to_owned())
        .unwrap_or_default();
    if peer.is_empty() || peer.chars().count() > settings.username_max_length {
        return bad_request("invalid_username");
    }
    if peer == caller {
        return bad_request("self_direct_chat");
    }

    match store.profile_exists(&peer).await {
        Ok(true) => {}
        Ok(false) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "user_not_found" })),
            )
                .into_response();
        }
        Err(err) => return degraded_start(&caller, &peer, err),
    }

    let room = match store.ensure_direct_room(&caller, &peer).await {
        Ok(room) => room,
        Err(err) => return degraded_start(&caller, &peer, err),
    };

    let image = peer_image(&store, &peer).await;
    let hints = ConnectionHints::from_parts(&headers, Some(settings.bind_addr), false);
    Json(json!({
        "slug": room.slug,
        "kind": room.kind.as_str(),
        "peer": {
            "username": peer,
            "profileImage": public_media_url(&settings, &hints, image.as_deref()),
        },
    }))
    .into_response()
}

/// The caller's direct-message inbox. Peer avatars resolve through the same
/// URL rules as everything else.
#[debug_handler(state = crate::AppState)]
async fn direct_chats(
    State(settings): State<Arc<Settings>>,
    State(store): State<SqliteStore>,
    identity: Identity,
    headers: HeaderMap,
) -> Response {
    let Some(caller) = identity.username else {
        return unauthorized();
    };

    let chats = match store.direct_chats_for(&caller).await {
        Ok(chats) => chats,
        Err(err) => {
            warn!(error = %err.0, "direct inbox degraded");
            return Json(json!({ "items": [] })).into_response();
        }
    };

    let hints = ConnectionHints::from_parts(&headers, Some(settings.bind_addr), false);
    let mut items = Vec::with_capacity(chats.len());
    for chat in chats {
        let image = peer_image(&store, &chat.peer).await;
        items.push(json!({
            "slug": chat.slug,
            "peer": {
                "username": chat.peer,
                "profileImage": public_media_url(&settings, &hints, image.as_deref()),
            },
            "lastMessage": chat.last_message,
            "lastMessageAt": chat.last_message_at,
        }));
    }

    Json(json!({ "items": items })).into_response()
}

async fn peer_image(store: &SqliteStore, peer: &str) -> Option<String> {
    match store.profile_image(peer).await {
        Ok(image) => image,
        Err(err) => {
            warn!(peer, error = %err.0, "peer profile lookup failed");
            None
        }
    }
}

fn degraded_start(caller: &str, peer: &str, err: AppError) -> Response {
    warn!(peer, error = %err.0, "direct start degraded");
    let slug = direct_room_slug(&access::direct_pair_key(caller, peer));
    Json(json!({
        "slug": slug,
        "kind": "direct",
        "peer": { "username": peer, "profileImage": null },
    }))
    .into_response()
}
