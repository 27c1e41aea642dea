use sqlx::SqlitePool;
use time::OffsetDateTime;

use crate::AppResult;
use crate::access::{self, Role, RoomKind};
use crate::store::{
    ChatStore, DirectChat, MessagePage, MessageRecord, PUBLIC_ROOM_NAME, PUBLIC_ROOM_SLUG, Room,
    RoomClaim, direct_room_slug,
};

type RoomRow = (i64, String, String, String, Option<String>, Option<String>);

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn room_from_row(row: RoomRow) -> Room {
    let (id, slug, name, kind, direct_pair_key, created_by) = row;
    Room {
        id,
        slug,
        name,
        kind: RoomKind::from_db(&kind),
        direct_pair_key,
        created_by,
    }
}

impl ChatStore for SqliteStore {
    async fn room_by_slug(&self, slug: &str) -> AppResult<Option<Room>> {
        let row: Option<RoomRow> = sqlx::query_as(
            "SELECT id, slug, name, kind, direct_pair_key, created_by FROM rooms WHERE slug=?",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(room_from_row))
    }

    async fn ensure_public_room(&self) -> AppResult<Room> {
        sqlx::query(
            "INSERT INTO rooms (slug, name, kind) VALUES (?, ?, 'public')
             ON CONFLICT(slug) DO NOTHING",
        )
        .bind(PUBLIC_ROOM_SLUG)
        .bind(PUBLIC_ROOM_NAME)
        .execute(&self.pool)
        .await?;

        self.room_by_slug(PUBLIC_ROOM_SLUG)
            .await?
            .ok_or("public room vanished during upsert".into())
    }

    async fn claim_room(&self, slug: &str, claimant: &str) -> AppResult<RoomClaim> {
        if let Some(room) = self.room_by_slug(slug).await? {
            return Ok(match room.created_by.as_deref() {
                Some(owner) if owner != claimant => RoomClaim::OwnedByOther(room),
                _ => RoomClaim::Existing(room),
            });
        }

        let room = self
            .insert_room(slug, slug, RoomKind::Private, None, Some(claimant))
            .await?;
        self.grant_role(room.id, claimant, Role::Owner, Some(claimant))
            .await?;
        Ok(RoomClaim::Created(room))
    }

    async fn insert_room(
        &self,
        slug: &str,
        name: &str,
        kind: RoomKind,
        direct_pair_key: Option<&str>,
        created_by: Option<&str>,
    ) -> AppResult<Room> {
        let result = sqlx::query(
            "INSERT INTO rooms (slug, name, kind, direct_pair_key, created_by)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(slug)
        .bind(name)
        .bind(kind.as_str())
        .bind(direct_pair_key)
        .bind(created_by)
        .execute(&self.pool)
        .await?;

        Ok(Room {
            id: result.last_insert_rowid(),
            slug: slug.to_owned(),
            name: name.to_owned(),
            kind,
            direct_pair_key: direct_pair_key.map(str::to_owned),
            created_by: created_by.map(str::to_owned),
        })
    }

    async fn ensure_direct_room(&self, a: &str, b: &str) -> AppResult<Room> {
        let pair_key = access::direct_pair_key(a, b);
        let slug = direct_room_slug(&pair_key);
        let created = sqlx::query(
            "INSERT INTO rooms (slug, name, kind, direct_pair_key)
             VALUES (?, ?, 'direct', ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(&slug)
        .bind(&pair_key)
        .bind(&pair_key)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        let room = match self.room_by_slug(&slug).await? {
            Some(room) => room,
            None => return Err("direct room vanished during upsert".into()),
        };
        if created {
            self.grant_role(room.id, a, Role::Member, None).await?;
            self.grant_role(room.id, b, Role::Member, None).await?;
        }
        Ok(room)
    }

    async fn direct_chats_for(&self, username: &str) -> AppResult<Vec<DirectChat>> {
        let rows: Vec<(String, Option<String>, Option<String>, Option<i64>)> = sqlx::query_as(
            "SELECT r.slug, r.direct_pair_key,
                    (SELECT content FROM messages WHERE room = r.slug
                     ORDER BY id DESC LIMIT 1) AS last_message,
                    (SELECT created_at FROM messages WHERE room = r.slug
                     ORDER BY id DESC LIMIT 1) AS last_at
             FROM rooms r
             JOIN chat_roles cr ON cr.room_id = r.id AND cr.username = ?
             WHERE r.kind = 'direct'
             ORDER BY last_at DESC, r.id DESC",
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(slug, pair_key, last_message, last_message_at)| {
                let peer = access::direct_peer(pair_key.as_deref()?, username)?.to_owned();
                Some(DirectChat {
                    slug,
                    peer,
                    last_message,
                    last_message_at,
                })
            })
            .collect())
    }

    async fn role_for(&self, room_id: i64, username: &str) -> AppResult<Option<Role>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT role FROM chat_roles WHERE room_id=? AND username=?")
                .bind(room_id)
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(role,)| Role::from_db(&role)))
    }

    async fn grant_role(
        &self,
        room_id: i64,
        username: &str,
        role: Role,
        granted_by: Option<&str>,
    ) -> AppResult<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        sqlx::query(
            "INSERT INTO chat_roles (room_id, username, role, granted_by, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(room_id, username) DO UPDATE SET
                 role = excluded.role,
                 granted_by = excluded.granted_by,
                 updated_at = excluded.updated_at",
        )
        .bind(room_id)
        .bind(username)
        .bind(role.as_str())
        .bind(granted_by)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_message(
        &self,
        room: &str,
        username: &str,
        user: Option<&str>,
        content: &str,
        profile_pic: Option<&str>,
    ) -> AppResult<i64> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let result = sqlx::query(
            "INSERT INTO messages (room, username, user, content, profile_pic, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(room)
        .bind(username)
        .bind(user)
        .bind(content)
        .bind(profile_pic)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn messages_before(
        &self,
        room: &str,
        before: Option<i64>,
        limit: i64,
    ) -> AppResult<MessagePage> {
        // One extra row decides has_more; a live profile row overrides the
        // write-time snapshot, including a NULL live image.
        let rows: Vec<(i64, String, String, String, Option<String>, i64)> = sqlx::query_as(
            "SELECT m.id, m.room,
                    COALESCE(p.username, m.username),
                    m.content,
                    CASE WHEN p.username IS NOT NULL THEN p.image ELSE m.profile_pic END,
                    m.created_at
             FROM messages m
             LEFT JOIN profiles p ON p.username = m.user
             WHERE m.room = ? AND (? IS NULL OR m.id < ?)
             ORDER BY m.id DESC
             LIMIT ?",
        )
        .bind(room)
        .bind(before)
        .bind(before)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() as i64 > limit;
        let mut messages: Vec<MessageRecord> = rows
            .into_iter()
            .take(limit as usize)
            .map(
                |(id, room, username, message, profile_pic, created_at)| MessageRecord {
                    id,
                    room,
                    username,
                    message,
                    profile_pic,
                    created_at,
                },
            )
            .collect();
        messages.reverse();

        Ok(MessagePage { messages, has_more })
    }

    async fn profile_exists(&self, username: &str) -> AppResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM profiles WHERE username=?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn profile_image(&self, username: &str) -> AppResult<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT image FROM profiles WHERE username=?")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(image,)| image))
    }

    async fn upsert_profile(&self, username: &str, image: Option<&str>) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO profiles (username, image) VALUES (?, ?)
             ON CONFLICT(username) DO UPDATE SET image = excluded.image",
        )
        .bind(username)
        .bind(image)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
