use axum::{extract::FromRequestParts, http::request::Parts};
use tower_sessions::Session;

/// Session key the external auth service writes the signed-in username under.
pub const USERNAME: &str = "username";

/// Who a request claims to be. Anonymous when the session is missing or
/// carries no username; extraction itself never fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub username: Option<String>,
}

impl Identity {
    pub fn authenticated(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.username.is_some()
    }
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Ok(session) = Session::from_request_parts(parts, state).await else {
            return Ok(Self::anonymous());
        };
        match session.get::<String>(USERNAME).await {
            Ok(Some(username)) => Ok(Self::authenticated(username)),
            _ => Ok(Self::anonymous()),
        }
    }
}
