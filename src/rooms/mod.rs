pub mod api;
mod direct;
pub mod gateway;
mod ws;

use axum::{Router, routing::get};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chat/{room}", get(ws::chat_ws))
        .nest("/api/chat", api::router().merge(direct::router()))
}
