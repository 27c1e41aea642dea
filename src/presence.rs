use std::net::{IpAddr, SocketAddr};

use axum::{
    Router, debug_handler,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::AppState;
use crate::media::url::{ConnectionHints, public_media_url};
use crate::net::client_ip;
use crate::session::Identity;
use crate::settings::Settings;
use crate::store::{ChatStore, sqlite::SqliteStore};

const PRESENCE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OnlineUser {
    pub username: String,
    #[serde(rename = "profileImage")]
    pub profile_image: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PresenceUpdate {
    pub online: Vec<OnlineUser>,
    pub guests: usize,
}

struct OnlineEntry {
    count: u32,
    profile_image: Option<String>,
}

/// Who is connected right now. Authenticated users are counted per username
/// across however many tabs they have open; anonymous viewers are counted
/// per client address. Every change broadcasts a fresh snapshot.
pub struct PresenceTracker {
    online: DashMap<String, OnlineEntry>,
    guests: DashMap<IpAddr, u32>,
    tx: broadcast::Sender<PresenceUpdate>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self {
            online: DashMap::new(),
            guests: DashMap::new(),
            tx: broadcast::channel(PRESENCE_CAPACITY).0,
        }
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.tx.subscribe()
    }

    /// The profile image sticks from the user's first live connection.
    pub fn join(&self, username: &str, profile_image: Option<String>) {
        self.online
            .entry(username.to_owned())
            .and_modify(|entry| entry.count += 1)
            .or_insert(OnlineEntry {
                count: 1,
                profile_image,
            });
        self.publish();
    }

    pub fn leave(&self, username: &str) {
        if let Some(mut entry) = self.online.get_mut(username) {
            entry.count = entry.count.saturating_sub(1);
        }
        self.online.remove_if(username, |_, entry| entry.count == 0);
        self.publish();
    }

    pub fn guest_join(&self, ip: IpAddr) {
        *self.guests.entry(ip).or_insert(0) += 1;
        self.publish();
    }

    pub fn guest_leave(&self, ip: IpAddr) {
        if let Some(mut count) = self.guests.get_mut(&ip) {
            *count = count.saturating_sub(1);
        }
        self.guests.remove_if(&ip, |_, count| *count == 0);
        self.publish();
    }

    /// Current state, compacting any entry a missed decrement left at zero.
    pub fn snapshot(&self) -> PresenceUpdate {
        self.online.retain(|_, entry| entry.count > 0);
        self.guests.retain(|_, count| *count > 0);

        let mut online: Vec<OnlineUser> = self
            .online
            .iter()
            .map(|entry| OnlineUser {
                username: entry.key().clone(),
                profile_image: entry.value().profile_image.clone(),
            })
            .collect();
        online.sort_by(|a, b| a.username.cmp(&b.username));

        PresenceUpdate {
            online,
            guests: self.guests.len(),
        }
    }

    fn publish(&self) {
        let _ = self.tx.send(self.snapshot());
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/presence", get(presence_ws))
}

/// Authenticated viewers get the online list; guests only get a count of
/// fellow guests. Each connection hears its own join as its first frame.
#[debug_handler(state = crate::AppState)]
async fn presence_ws(
    State(settings): State<Arc<Settings>>,
    State(store): State<SqliteStore>,
    State(presence): State<Arc<PresenceTracker>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    identity: Identity,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let hints = ConnectionHints::from_parts(&headers, Some(settings.bind_addr), false);
    let ip = client_ip(remote, &headers, &settings.trusted_proxies);

    ws.on_upgrade(async move |stream| {
        let mut rx = presence.subscribe();

        let viewer = identity.username.clone();
        match viewer.as_deref() {
            Some(username) => {
                let image = match store.profile_image(username).await {
                    Ok(image) => image,
                    Err(err) => {
                        warn!(user = username, error = %err.0, "profile lookup failed");
                        None
                    }
                };
                let resolved = public_media_url(&settings, &hints, image.as_deref());
                presence.join(username, resolved);
            }
            None => presence.guest_join(ip),
        }
        debug!(user = viewer.as_deref().unwrap_or("guest"), "presence connection open");

        let (mut sender, mut receiver) = stream.split();
        let authenticated = viewer.is_some();
        let mut forward_task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(update) => {
                        let payload = render_view(&update, authenticated);
                        if sender.send(payload.into()).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "presence stream lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // inbound frames carry nothing; the loop just notices the hangup
        while let Some(Ok(_)) = receiver.next().await {}

        forward_task.abort();
        let _ = (&mut forward_task).await;

        match viewer.as_deref() {
            Some(username) => presence.leave(username),
            None => presence.guest_leave(ip),
        }
        debug!(user = viewer.as_deref().unwrap_or("guest"), "presence connection closed");
    })
}

fn render_view(update: &PresenceUpdate, authenticated: bool) -> String {
    if authenticated {
        json!({ "online": update.online }).to_string()
    } else {
        json!({ "guests": update.guests }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users(update: &PresenceUpdate) -> Vec<&str> {
        update.online.iter().map(|u| u.username.as_str()).collect()
    }

    #[test]
    fn joins_are_refcounted_per_username() {
        let tracker = PresenceTracker::new();
        tracker.join("alice", None);
        tracker.join("alice", None);
        tracker.join("bob", None);
        assert_eq!(users(&tracker.snapshot()), ["alice", "bob"]);

        tracker.leave("alice");
        assert_eq!(users(&tracker.snapshot()), ["alice", "bob"]);
        tracker.leave("alice");
        assert_eq!(users(&tracker.snapshot()), ["bob"]);
    }

    #[test]
    fn leaving_twice_never_underflows() {
        let tracker = PresenceTracker::new();
        tracker.join("alice", None);
        tracker.leave("alice");
        tracker.leave("alice");
        assert!(tracker.snapshot().online.is_empty());

        tracker.join("alice", None);
        assert_eq!(users(&tracker.snapshot()), ["alice"]);
    }

    #[test]
    fn the_first_connection_pins_the_profile_image() {
        let tracker = PresenceTracker::new();
        tracker.join("alice", Some("https://cdn/a.jpg".into()));
        tracker.join("alice", Some("https://cdn/b.jpg".into()));

        let snapshot = tracker.snapshot();
        assert_eq!(
            snapshot.online[0].profile_image.as_deref(),
            Some("https://cdn/a.jpg")
        );
    }

    #[test]
    fn guests_are_counted_per_address() {
        let tracker = PresenceTracker::new();
        let here: IpAddr = "198.51.100.7".parse().unwrap();
        let there: IpAddr = "203.0.113.9".parse().unwrap();

        tracker.guest_join(here);
        tracker.guest_join(here);
        tracker.guest_join(there);
        assert_eq!(tracker.snapshot().guests, 2);

        tracker.guest_leave(here);
        assert_eq!(tracker.snapshot().guests, 2);
        tracker.guest_leave(here);
        assert_eq!(tracker.snapshot().guests, 1);
    }

    #[tokio::test]
    async fn every_change_broadcasts_a_snapshot() {
        let tracker = PresenceTracker::new();
        let mut rx = tracker.subscribe();

        tracker.join("alice", None);
        let update = rx.recv().await.unwrap();
        assert_eq!(users(&update), ["alice"]);

        tracker.leave("alice");
        let update = rx.recv().await.unwrap();
        assert!(update.online.is_empty());
    }

    #[test]
    fn guest_and_authenticated_views_differ() {
        let update = PresenceUpdate {
            online: vec![OnlineUser {
                username: "alice".into(),
                profile_image: None,
            }],
            guests: 3,
        };

        let auth: serde_json::Value =
            serde_json::from_str(&render_view(&update, true)).unwrap();
        assert_eq!(auth["online"][0]["username"], "alice");
        assert!(auth["online"][0]["profileImage"].is_null());
        assert!(auth.get("guests").is_none());

        let guest: serde_json::Value =
            serde_json::from_str(&render_view(&update, false)).unwrap();
        assert_eq!(guest["guests"], 3);
        assert!(guest.get("online").is_none());
    }
}
