//! Durable dispatch outbox.
//!
//! One row per (alert × channel × recipient). Rows are deduplicated on a
//! deterministic key, so re-deriving the same alert on every scheduled run
//! is safe: only the first occurrence is ever queued. All status mutations
//! are single conditional UPDATEs — claim, sent, retry, failed, stale sweep —
//! which keeps the queue correct under any number of worker processes
//! without multi-row transactions.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use vigia_common::error::AppError;
use vigia_common::types::{AlertKind, DispatchChannel, DispatchRecord, ExpirationAlert};

use crate::channel::ChannelPolicy;

/// Retry delays stop growing at 24 hours.
const MAX_BACKOFF_SECONDS: i64 = 86_400;

/// Deterministic identity of one logical dispatch:
/// `tenant|channel|normalized_recipient|kind|entity|due_date`.
///
/// The key survives across runs; it only changes when the underlying due
/// date moves, which is exactly when a fresh notification is wanted.
pub fn dedupe_key(
    tenant_id: &str,
    channel: DispatchChannel,
    recipient: &str,
    kind: AlertKind,
    entity_id: &str,
    due_date: NaiveDate,
) -> String {
    format!(
        "{tenant_id}|{channel}|{}|{kind}|{entity_id}|{due_date}",
        normalize_recipient(channel, recipient)
    )
}

/// Normalize a recipient for dedupe purposes only; the stored recipient
/// keeps its original (trimmed) form for delivery.
///
/// Emails are case-insensitive in practice, phone numbers carry formatting
/// noise (`+`, spaces, dashes), URLs are taken as-is since paths are
/// case-sensitive.
pub fn normalize_recipient(channel: DispatchChannel, recipient: &str) -> String {
    match channel {
        DispatchChannel::Webhook => recipient.trim().to_string(),
        DispatchChannel::Email => recipient.trim().to_lowercase(),
        DispatchChannel::Whatsapp => recipient
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect(),
    }
}

/// Exponential backoff for attempt number `new_attempts` (1-based, the
/// value *after* the failed attempt was counted): `base * 2^(n-1)`,
/// capped at 24 hours.
pub fn backoff_delay_seconds(new_attempts: i32, base_seconds: i64) -> i64 {
    let exponent = new_attempts.saturating_sub(1).clamp(0, 62) as u32;
    let multiplier = 1i64.checked_shl(exponent).unwrap_or(i64::MAX);
    base_seconds
        .saturating_mul(multiplier)
        .min(MAX_BACKOFF_SECONDS)
}

/// A not-yet-persisted outbox row.
#[derive(Debug, Clone)]
pub struct DispatchCandidate {
    pub tenant_id: String,
    pub tenant_name: String,
    pub channel: DispatchChannel,
    pub recipient: String,
    pub dedupe_key: String,
    pub alert_kind: AlertKind,
    pub entity_id: String,
    pub title: String,
    pub company_name: Option<String>,
    pub due_date: NaiveDate,
    pub max_attempts: i32,
    pub backoff_base_seconds: i64,
}

impl DispatchCandidate {
    /// Build the candidate for one recipient of one resolved channel.
    pub fn from_alert(
        alert: &ExpirationAlert,
        channel: DispatchChannel,
        recipient: &str,
        policy: &ChannelPolicy,
    ) -> Self {
        Self {
            dedupe_key: dedupe_key(
                &alert.tenant_id,
                channel,
                recipient,
                alert.kind,
                &alert.entity_id,
                alert.due_date,
            ),
            tenant_id: alert.tenant_id.clone(),
            tenant_name: alert.tenant_name.clone(),
            channel,
            recipient: recipient.trim().to_string(),
            alert_kind: alert.kind,
            entity_id: alert.entity_id.clone(),
            title: alert.title.clone(),
            company_name: alert.company_name.clone(),
            due_date: alert.due_date,
            max_attempts: policy.max_attempts,
            backoff_base_seconds: policy.backoff_base_seconds,
        }
    }
}

/// Counters returned by [`DispatchRepo::enqueue`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub queued: u32,
    pub deduplicated: u32,
}

/// Storage operations on the `alert_dispatches` outbox table.
pub struct DispatchRepo;

impl DispatchRepo {
    /// Insert candidates as `pending` rows, silently skipping any whose
    /// dedupe key already exists.
    pub async fn enqueue(
        pool: &PgPool,
        candidates: &[DispatchCandidate],
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, AppError> {
        let mut outcome = EnqueueOutcome::default();

        for candidate in candidates {
            let result = sqlx::query(
                r#"
                INSERT INTO alert_dispatches (
                    id, tenant_id, tenant_name, channel, recipient, dedupe_key,
                    alert_kind, entity_id, title, company_name, due_date,
                    attempts, max_attempts, backoff_base_seconds,
                    next_attempt_at, status, created_at, updated_at
                )
                VALUES (
                    $1, $2, $3, $4, $5, $6,
                    $7, $8, $9, $10, $11,
                    0, $12, $13,
                    $14, 'pending', $14, $14
                )
                ON CONFLICT (dedupe_key) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&candidate.tenant_id)
            .bind(&candidate.tenant_name)
            .bind(candidate.channel.to_string())
            .bind(&candidate.recipient)
            .bind(&candidate.dedupe_key)
            .bind(candidate.alert_kind.to_string())
            .bind(&candidate.entity_id)
            .bind(&candidate.title)
            .bind(&candidate.company_name)
            .bind(candidate.due_date)
            .bind(candidate.max_attempts)
            .bind(candidate.backoff_base_seconds)
            .bind(now)
            .execute(pool)
            .await?;

            if result.rows_affected() > 0 {
                outcome.queued += 1;
            } else {
                outcome.deduplicated += 1;
            }
        }

        Ok(outcome)
    }

    /// Due rows for one channel, oldest `next_attempt_at` first.
    pub async fn list_due(
        pool: &PgPool,
        channel: DispatchChannel,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DispatchRecord>, AppError> {
        let rows: Vec<DispatchRecord> = sqlx::query_as(
            r#"
            SELECT *
            FROM alert_dispatches
            WHERE channel = $1
              AND status = 'pending'
              AND next_attempt_at <= $2
            ORDER BY next_attempt_at ASC, created_at ASC
            LIMIT $3
            "#,
        )
        .bind(channel.to_string())
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }

    /// Atomically move a row from `pending` to `processing`, stamping this
    /// instance as owner. Returns `None` when another instance won the row
    /// (or it stopped being due) — the caller just skips it.
    pub async fn claim(
        pool: &PgPool,
        id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchRecord>, AppError> {
        let row: Option<DispatchRecord> = sqlx::query_as(
            r#"
            UPDATE alert_dispatches
            SET status = 'processing',
                processing_owner = $2,
                processing_started_at = $3,
                updated_at = $3
            WHERE id = $1
              AND status = 'pending'
              AND next_attempt_at <= $3
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(now)
        .fetch_optional(pool)
        .await?;

        Ok(row)
    }

    /// Terminal success. Only the claiming owner can complete the row.
    pub async fn mark_sent(
        pool: &PgPool,
        id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE alert_dispatches
            SET status = 'sent',
                attempts = attempts + 1,
                last_error = NULL,
                processing_owner = NULL,
                processing_started_at = NULL,
                updated_at = $3
            WHERE id = $1
              AND status = 'processing'
              AND processing_owner = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Failed attempt with retries left: back to `pending` with a future
    /// `next_attempt_at`.
    pub async fn mark_retry(
        pool: &PgPool,
        id: Uuid,
        owner: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE alert_dispatches
            SET status = 'pending',
                attempts = attempts + 1,
                last_error = $3,
                next_attempt_at = $4,
                processing_owner = NULL,
                processing_started_at = NULL,
                updated_at = $5
            WHERE id = $1
              AND status = 'processing'
              AND processing_owner = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(error)
        .bind(next_attempt_at)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Attempts exhausted: terminal `failed`, never picked up again.
    pub async fn mark_failed(
        pool: &PgPool,
        id: Uuid,
        owner: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE alert_dispatches
            SET status = 'failed',
                attempts = attempts + 1,
                last_error = $3,
                processing_owner = NULL,
                processing_started_at = NULL,
                updated_at = $4
            WHERE id = $1
              AND status = 'processing'
              AND processing_owner = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(error)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Force rows stuck in `processing` past the staleness window back to
    /// `pending`, due immediately — regardless of owner. Covers instances
    /// that crashed mid-delivery; bounds the worst-case delivery delay to
    /// the window itself.
    pub async fn recover_stale(
        pool: &PgPool,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<u64, AppError> {
        let cutoff = now - stale_after;
        let result = sqlx::query(
            r#"
            UPDATE alert_dispatches
            SET status = 'pending',
                next_attempt_at = $2,
                processing_owner = NULL,
                processing_started_at = NULL,
                updated_at = $2
            WHERE status = 'processing'
              AND processing_started_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_alert() -> ExpirationAlert {
        ExpirationAlert {
            kind: AlertKind::Pgr,
            tenant_id: "tenant-1".to_string(),
            tenant_name: "Acme Seguranca".to_string(),
            entity_id: "pgr-42".to_string(),
            title: "PGR Matriz".to_string(),
            company_name: Some("Acme Ltda".to_string()),
            due_date: NaiveDate::from_ymd_opt(2026, 2, 28).unwrap(),
            days_until_due: 9,
        }
    }

    #[test]
    fn test_dedupe_key_composition() {
        let key = dedupe_key(
            "tenant-1",
            DispatchChannel::Email,
            "Safety@Acme.com",
            AlertKind::Pgr,
            "pgr-42",
            NaiveDate::from_ymd_opt(2026, 2, 28).unwrap(),
        );
        assert_eq!(key, "tenant-1|email|safety@acme.com|pgr|pgr-42|2026-02-28");
    }

    #[test]
    fn test_normalize_email_lowercases_and_trims() {
        assert_eq!(
            normalize_recipient(DispatchChannel::Email, "  RH@Acme.COM "),
            "rh@acme.com"
        );
    }

    #[test]
    fn test_normalize_whatsapp_keeps_digits_only() {
        assert_eq!(
            normalize_recipient(DispatchChannel::Whatsapp, "+55 (11) 99999-0000"),
            "5511999990000"
        );
    }

    #[test]
    fn test_normalize_webhook_preserves_case() {
        // URL paths are case-sensitive; only whitespace is stripped
        assert_eq!(
            normalize_recipient(DispatchChannel::Webhook, " https://x.dev/Hook "),
            "https://x.dev/Hook"
        );
    }

    #[test]
    fn test_equivalent_recipients_share_a_key() {
        let due = NaiveDate::from_ymd_opt(2026, 2, 28).unwrap();
        let a = dedupe_key(
            "t1",
            DispatchChannel::Whatsapp,
            "+5511999990000",
            AlertKind::Training,
            "tr-1",
            due,
        );
        let b = dedupe_key(
            "t1",
            DispatchChannel::Whatsapp,
            "55 11 99999-0000",
            AlertKind::Training,
            "tr-1",
            due,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_due_date_change_changes_key() {
        let a = dedupe_key(
            "t1",
            DispatchChannel::Email,
            "a@x.com",
            AlertKind::Pgr,
            "pgr-1",
            NaiveDate::from_ymd_opt(2026, 2, 28).unwrap(),
        );
        let b = dedupe_key(
            "t1",
            DispatchChannel::Email,
            "a@x.com",
            AlertKind::Pgr,
            "pgr-1",
            NaiveDate::from_ymd_opt(2027, 2, 28).unwrap(),
        );
        assert_ne!(a, b);
    }

    #[test]
    fn test_candidate_from_alert_carries_policy() {
        let policy = ChannelPolicy {
            max_attempts: 3,
            max_per_run: 10,
            backoff_base_seconds: 120,
        };
        let candidate = DispatchCandidate::from_alert(
            &make_alert(),
            DispatchChannel::Email,
            " safety@acme.com ",
            &policy,
        );

        assert_eq!(candidate.recipient, "safety@acme.com");
        assert_eq!(candidate.max_attempts, 3);
        assert_eq!(candidate.backoff_base_seconds, 120);
        assert_eq!(
            candidate.dedupe_key,
            "tenant-1|email|safety@acme.com|pgr|pgr-42|2026-02-28"
        );
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay_seconds(1, 60), 60);
        assert_eq!(backoff_delay_seconds(2, 60), 120);
        assert_eq!(backoff_delay_seconds(3, 60), 240);
        assert_eq!(backoff_delay_seconds(4, 60), 480);
    }

    #[test]
    fn test_backoff_caps_at_24_hours() {
        assert_eq!(backoff_delay_seconds(11, 60), 61_440);
        assert_eq!(backoff_delay_seconds(12, 60), MAX_BACKOFF_SECONDS);
        assert_eq!(backoff_delay_seconds(40, 60), MAX_BACKOFF_SECONDS);
        assert_eq!(backoff_delay_seconds(i32::MAX, 60), MAX_BACKOFF_SECONDS);
    }

    #[test]
    fn test_backoff_tolerates_degenerate_attempt_numbers() {
        assert_eq!(backoff_delay_seconds(0, 60), 60);
        assert_eq!(backoff_delay_seconds(-5, 60), 60);
    }
}
