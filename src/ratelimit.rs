use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::warn;

use crate::AppResult;

#[derive(Debug, Clone, Copy)]
pub struct RatePolicy {
    pub limit: i64,
    pub window_seconds: i64,
}

/// Fixed-window counter backed by the database, so restarts do not forget
/// recent activity. The check-and-increment is a single statement; SQLite
/// serializes writers, so concurrent senders cannot lose updates.
#[derive(Clone)]
pub struct RateLimiter {
    pool: SqlitePool,
}

impl RateLimiter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn is_limited(&self, scope_key: &str, policy: RatePolicy) -> bool {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.is_limited_at(scope_key, policy, now).await
    }

    /// Deterministic entry point: the caller supplies the clock.
    pub async fn is_limited_at(&self, scope_key: &str, policy: RatePolicy, now: i64) -> bool {
        match self.bump(scope_key, policy, now).await {
            Ok(count) => count > policy.limit,
            Err(err) => {
                warn!(scope = scope_key, error = %err.0, "rate limiter unavailable, allowing");
                false
            }
        }
    }

    async fn bump(&self, scope_key: &str, policy: RatePolicy, now: i64) -> AppResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "INSERT INTO rate_limits (scope_key, window_start, count) VALUES (?, ?, 1)
             ON CONFLICT(scope_key) DO UPDATE SET
                 count = CASE WHEN ? - window_start >= ? THEN 1 ELSE count + 1 END,
                 window_start = CASE WHEN ? - window_start >= ? THEN ? ELSE window_start END
             RETURNING count",
        )
        .bind(scope_key)
        .bind(now)
        .bind(now)
        .bind(policy.window_seconds)
        .bind(now)
        .bind(policy.window_seconds)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    const POLICY: RatePolicy = RatePolicy {
        limit: 2,
        window_seconds: 30,
    };

    #[tokio::test]
    async fn limits_kick_in_after_the_allowance() {
        let limiter = RateLimiter::new(db::test_pool().await);

        assert!(!limiter.is_limited_at("rl:test:a", POLICY, 100).await);
        assert!(!limiter.is_limited_at("rl:test:a", POLICY, 101).await);
        assert!(limiter.is_limited_at("rl:test:a", POLICY, 102).await);
    }

    #[tokio::test]
    async fn the_window_resets_cleanly() {
        let limiter = RateLimiter::new(db::test_pool().await);

        for t in [100, 101, 102] {
            limiter.is_limited_at("rl:test:a", POLICY, t).await;
        }
        assert!(limiter.is_limited_at("rl:test:a", POLICY, 103).await);
        // first send of the next window counts from one again
        assert!(!limiter.is_limited_at("rl:test:a", POLICY, 130).await);
        assert!(!limiter.is_limited_at("rl:test:a", POLICY, 131).await);
        assert!(limiter.is_limited_at("rl:test:a", POLICY, 132).await);
    }

    #[tokio::test]
    async fn scopes_do_not_bleed_into_each_other() {
        let limiter = RateLimiter::new(db::test_pool().await);

        for t in [100, 101, 102] {
            limiter.is_limited_at("rl:test:alice", POLICY, t).await;
        }
        assert!(limiter.is_limited_at("rl:test:alice", POLICY, 103).await);
        assert!(!limiter.is_limited_at("rl:test:bob", POLICY, 103).await);
    }

    #[tokio::test]
    async fn a_missing_table_degrades_to_allowing() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let limiter = RateLimiter::new(pool);

        assert!(!limiter.is_limited_at("rl:test:a", POLICY, 100).await);
    }
}
