use std::sync::Arc;

use axum::{Json, Router, debug_handler, extract::State, routing::get};
use serde_json::{Value, json};

use crate::AppState;
use crate::settings::Settings;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/meta/client-config", get(client_config))
}

/// The limits a frontend needs to mirror validation without hardcoding it.
#[debug_handler(state = crate::AppState)]
async fn client_config(State(settings): State<Arc<Settings>>) -> Json<Value> {
    Json(json!({
        "usernameMaxLength": settings.username_max_length,
        "chatMessageMaxLength": settings.message_max_length,
        "chatRoomSlugRegex": settings.slug_pattern_source,
        "mediaUrlTtlSeconds": settings.media_url_ttl,
        "mediaMode": "signed_only",
    }))
}
