use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(16)
        .connect_with(options)
        .await
}

/// Create the schema if it is not there yet. Timestamps are unix seconds.
pub async fn init(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rooms (
            id INTEGER PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'private',
            direct_pair_key TEXT UNIQUE,
            created_by TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_roles (
            room_id INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
            username TEXT NOT NULL,
            role TEXT NOT NULL,
            granted_by TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (room_id, username)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chat_roles_room_role ON chat_roles (room_id, role)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            room TEXT NOT NULL,
            username TEXT NOT NULL,
            user TEXT,
            content TEXT NOT NULL,
            profile_pic TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_room_created ON messages (room, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_user_created ON messages (username, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS profiles (
            username TEXT PRIMARY KEY,
            image TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rate_limits (
            scope_key TEXT PRIMARY KEY,
            window_start INTEGER NOT NULL,
            count INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    init(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_is_idempotent() {
        let pool = test_pool().await;
        init(&pool).await.unwrap();

        sqlx::query("INSERT INTO rooms (slug, name, kind) VALUES ('general', 'General', 'public')")
            .execute(&pool)
            .await
            .unwrap();
        let (kind,): (String,) =
            sqlx::query_as("SELECT kind FROM rooms WHERE slug = 'general'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(kind, "public");
    }

    #[tokio::test]
    async fn role_rows_cascade_with_their_room() {
        let pool = test_pool().await;
        sqlx::query("INSERT INTO rooms (id, slug, name) VALUES (1, 'team', 'Team')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO chat_roles (room_id, username, role, created_at, updated_at)
             VALUES (1, 'alice', 'owner', 0, 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query("DELETE FROM rooms WHERE id = 1")
            .execute(&pool)
            .await
            .unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chat_roles")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
