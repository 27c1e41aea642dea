pub mod access;
pub mod auth;
pub mod broadcast;
pub mod db;
pub mod health;
pub mod media;
pub mod meta;
pub mod net;
pub mod presence;
pub mod ratelimit;
pub mod rooms;
pub mod session;
pub mod settings;
pub mod store;

use std::sync::Arc;

use axum::{
    Router,
    extract::FromRef,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer, cookie::SameSite};

use broadcast::RoomGroups;
use presence::PresenceTracker;
use ratelimit::RateLimiter;
use settings::Settings;
use store::sqlite::SqliteStore;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub settings: Arc<Settings>,
    pub store: SqliteStore,
    pub limiter: RateLimiter,
    pub groups: Arc<RoomGroups>,
    pub presence: Arc<PresenceTracker>,
    /// Session records behind the cookie layer; identities land here.
    pub sessions: MemoryStore,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, settings: Settings) -> Self {
        Self {
            store: SqliteStore::new(db_pool.clone()),
            limiter: RateLimiter::new(db_pool.clone()),
            db_pool,
            settings: Arc::new(settings),
            groups: Arc::new(RoomGroups::new()),
            presence: Arc::new(PresenceTracker::new()),
            sessions: MemoryStore::default(),
        }
    }
}

/// The full application router. Tests drive exactly what production serves.
pub fn app(state: AppState) -> Router {
    let session_layer = SessionManagerLayer::new(state.sessions.clone())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::hours(12)));

    Router::new()
        .merge(health::router())
        .merge(meta::router())
        .merge(auth::router())
        .merge(rooms::router())
        .merge(presence::router())
        .merge(media::router())
        .layer(session_layer)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{}\n\n{}", self.0, self.0.backtrace()),
        )
            .into_response()
    }
}

impl From<String> for AppError {
    fn from(err: String) -> Self {
        Self(anyhow::Error::msg(err))
    }
}

impl From<&str> for AppError {
    fn from(err: &str) -> Self {
        Self(anyhow::Error::msg(err.to_owned()))
    }
}

macro_rules! apperr_impl {
    ($E:ty) => {
        impl From<$E> for AppError {
            fn from(err: $E) -> Self {
                Self(anyhow::Error::from(err))
            }
        }
    };
}

apperr_impl!(serde_json::Error);
apperr_impl!(sqlx::Error);
apperr_impl!(tower_sessions::session::Error);
apperr_impl!(axum::Error);
apperr_impl!(std::io::Error);
