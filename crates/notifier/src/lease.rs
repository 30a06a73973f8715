//! Cross-process job lease backed by a Postgres row.
//!
//! Acquisition is a single conditional upsert, so two instances racing for
//! the same job name resolve at the storage layer: the insert wins on a
//! fresh name, the update half only fires when the existing lease is
//! expired or already held by the caller (re-entrant). Everything else is
//! a failed acquisition, which callers treat as a normal skip.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

use vigia_common::error::AppError;

/// TTL floor. A shorter lease than this would let two instances leapfrog
/// each other on ordinary clock skew and run lengths.
pub const MIN_TTL_SECONDS: i64 = 30;

/// Storage operations on the `job_locks` table.
pub struct JobLeaseRepo;

impl JobLeaseRepo {
    /// Try to take (or re-take) the lease for `job_name`.
    ///
    /// Returns `true` when this owner now holds the lease until
    /// `now + ttl_seconds` (clamped to the floor).
    pub async fn try_acquire(
        pool: &PgPool,
        job_name: &str,
        owner_id: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let locked_until = now + Duration::seconds(clamp_ttl(ttl_seconds));

        let result = sqlx::query(
            r#"
            INSERT INTO job_locks (job_name, owner_id, locked_until, acquired_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (job_name) DO UPDATE
            SET owner_id = EXCLUDED.owner_id,
                locked_until = EXCLUDED.locked_until,
                acquired_at = EXCLUDED.acquired_at
            WHERE job_locks.locked_until < $4
               OR job_locks.owner_id = EXCLUDED.owner_id
            "#,
        )
        .bind(job_name)
        .bind(owner_id)
        .bind(locked_until)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Release the lease if — and only if — the caller still owns it.
    ///
    /// A stale release (the lease expired and someone else took it) is a
    /// silent no-op, so a slow instance can never evict a newer holder.
    pub async fn release(
        pool: &PgPool,
        job_name: &str,
        owner_id: &str,
    ) -> Result<(), AppError> {
        sqlx::query("DELETE FROM job_locks WHERE job_name = $1 AND owner_id = $2")
            .bind(job_name)
            .bind(owner_id)
            .execute(pool)
            .await?;

        Ok(())
    }
}

fn clamp_ttl(ttl_seconds: i64) -> i64 {
    ttl_seconds.max(MIN_TTL_SECONDS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_floor_applied() {
        assert_eq!(clamp_ttl(5), 30);
        assert_eq!(clamp_ttl(0), 30);
        assert_eq!(clamp_ttl(-10), 30);
        assert_eq!(clamp_ttl(600), 600);
    }
}
