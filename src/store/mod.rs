pub mod sqlite;

use sha2::{Digest, Sha256};

use crate::AppResult;
use crate::access::{Role, RoomKind};

pub const PUBLIC_ROOM_SLUG: &str = "public";
pub const PUBLIC_ROOM_NAME: &str = "Public Chat";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub kind: RoomKind,
    pub direct_pair_key: Option<String>,
    pub created_by: Option<String>,
}

/// A stored message as the history API sees it: username and picture already
/// prefer the live profile over the write-time snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: i64,
    pub room: String,
    pub username: String,
    pub message: String,
    pub profile_pic: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct MessagePage {
    /// Ascending by id within the page.
    pub messages: Vec<MessageRecord>,
    pub has_more: bool,
}

#[derive(Debug, Clone)]
pub enum RoomClaim {
    Created(Room),
    Existing(Room),
    OwnedByOther(Room),
}

/// One entry in a user's direct-message inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectChat {
    pub slug: String,
    pub peer: String,
    pub last_message: Option<String>,
    pub last_message_at: Option<i64>,
}

/// Deterministic slug for the DIRECT room of a pair. Usernames are too long
/// and too loosely shaped to concatenate into a slug, so the pair key is
/// hashed instead.
pub fn direct_room_slug(pair_key: &str) -> String {
    use std::fmt::Write;
    Sha256::digest(pair_key.as_bytes())[..8]
        .iter()
        .fold(String::from("dm-"), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
}

/// Storage contract for rooms, roles, messages and profiles. The gateway and
/// the HTTP API only ever talk to storage through this.
#[allow(async_fn_in_trait)]
pub trait ChatStore {
    async fn room_by_slug(&self, slug: &str) -> AppResult<Option<Room>>;

    /// The single PUBLIC room, created on first use.
    async fn ensure_public_room(&self) -> AppResult<Room>;

    /// Idempotent lookup-or-create. A fresh room is PRIVATE, owned by the
    /// claimant with an OWNER role granted.
    async fn claim_room(&self, slug: &str, claimant: &str) -> AppResult<RoomClaim>;

    async fn insert_room(
        &self,
        slug: &str,
        name: &str,
        kind: RoomKind,
        direct_pair_key: Option<&str>,
        created_by: Option<&str>,
    ) -> AppResult<Room>;

    /// The DIRECT room shared by `a` and `b`, created on first contact with a
    /// MEMBER role for both.
    async fn ensure_direct_room(&self, a: &str, b: &str) -> AppResult<Room>;

    /// DIRECT rooms `username` participates in, most recently active first.
    async fn direct_chats_for(&self, username: &str) -> AppResult<Vec<DirectChat>>;

    async fn role_for(&self, room_id: i64, username: &str) -> AppResult<Option<Role>>;

    async fn grant_role(
        &self,
        room_id: i64,
        username: &str,
        role: Role,
        granted_by: Option<&str>,
    ) -> AppResult<()>;

    /// Persist a message; `username` is the display snapshot, `user` the
    /// authoritative sender reference, `profile_pic` a relative media path.
    async fn insert_message(
        &self,
        room: &str,
        username: &str,
        user: Option<&str>,
        content: &str,
        profile_pic: Option<&str>,
    ) -> AppResult<i64>;

    /// Up to `limit` messages older than `before` (all newest when `None`).
    async fn messages_before(
        &self,
        room: &str,
        before: Option<i64>,
        limit: i64,
    ) -> AppResult<MessagePage>;

    async fn profile_exists(&self, username: &str) -> AppResult<bool>;

    async fn profile_image(&self, username: &str) -> AppResult<Option<String>>;

    async fn upsert_profile(&self, username: &str, image: Option<&str>) -> AppResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_slugs_are_stable_and_slug_shaped() {
        let slug = direct_room_slug("alice:bob");
        assert_eq!(slug, direct_room_slug("alice:bob"));
        assert_ne!(slug, direct_room_slug("alice:carol"));
        assert!(slug.starts_with("dm-"));
        assert_eq!(slug.len(), 19);
        assert!(crate::settings::Settings::default().is_valid_slug(&slug));
    }
}
