use std::sync::Arc;

use axum::{
    Json, Router, debug_handler,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::{Value, json};
use tower_sessions::Session;

use crate::AppResult;
use crate::AppState;
use crate::media::url::{ConnectionHints, public_media_url};
use crate::session::Identity;
use crate::settings::Settings;
use crate::store::{ChatStore, sqlite::SqliteStore};

const PRESENCE_FLAG: &str = "presence";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/auth/session", get(session_info))
        .route("/api/auth/users/{username}", get(public_profile))
        .route(
            "/api/auth/presence-session",
            get(presence_session).post(presence_session),
        )
}

/// Who the cookie says this is. Identity itself is written by the external
/// auth service; this endpoint only reflects it back with a resolved avatar.
#[debug_handler(state = crate::AppState)]
async fn session_info(
    State(settings): State<Arc<Settings>>,
    State(store): State<SqliteStore>,
    identity: Identity,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    Ok(Json(match identity.username.as_deref() {
        Some(username) => {
            let image = store.profile_image(username).await?;
            let hints = ConnectionHints::from_parts(&headers, Some(settings.bind_addr), false);
            json!({
                "authenticated": true,
                "user": {
                    "username": username,
                    "profileImage": public_media_url(&settings, &hints, image.as_deref()),
                },
            })
        }
        None => json!({ "authenticated": false, "user": null }),
    }))
}

/// Public card for one user: the name and a resolved avatar, nothing more.
#[debug_handler(state = crate::AppState)]
async fn public_profile(
    Path(username): Path<String>,
    State(settings): State<Arc<Settings>>,
    State(store): State<SqliteStore>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let username = username.trim();
    if username.is_empty() || !store.profile_exists(username).await? {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "user_not_found" })),
        )
            .into_response());
    }

    let image = store.profile_image(username).await?;
    let hints = ConnectionHints::from_parts(&headers, Some(settings.bind_addr), false);
    Ok(Json(json!({
        "user": {
            "username": username,
            "profileImage": public_media_url(&settings, &hints, image.as_deref()),
        },
    }))
    .into_response())
}

/// Guests need a cookie before the presence socket can tell them apart from
/// nothing at all; touching the session forces one out.
#[debug_handler]
async fn presence_session(session: Session) -> AppResult<Json<Value>> {
    session.insert(PRESENCE_FLAG, true).await?;
    Ok(Json(json!({ "ok": true })))
}
